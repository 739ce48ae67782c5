//! Activity definitions: the declarative workflow tree
//!
//! An [`ActivityDefinition`] describes one node of the tree. Composite kinds
//! own an ordered list of children; the engine instantiates the tree into an
//! arena when a workflow instance is created.

use crate::{ActivityCondition, QualifiedName, QueueName, VariableUpdate, WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ── Activity Kinds ───────────────────────────────────────────────────

/// Scheduling mode of a replicator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    /// One iteration at a time, in list order
    Sequence,
    /// Every pending item runs at once
    Parallel,
}

/// The behaviour of an activity node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActivityKind {
    Sequence,
    Parallel,
    Listen,
    /// A branch whose first child is an event activity
    EventDriven,
    EventHandlingScope,
    EventHandlers,
    ConditionedActivityGroup {
        until: Option<ActivityCondition>,
    },
    Replicator {
        execution_type: ExecutionType,
        until: Option<ActivityCondition>,
        initial_child_data: Vec<serde_json::Value>,
    },
    /// Root state of a state machine workflow
    StateMachine {
        initial_state: QualifiedName,
        completed_state: Option<QualifiedName>,
    },
    State,
    StateInitialization,
    StateFinalization,
    /// Requests a transition of the enclosing state machine
    SetState {
        target_state: QualifiedName,
    },
    /// Event activity: consumes one item from a workflow queue
    WaitForEvent {
        queue: QueueName,
    },
    Code {
        updates: Vec<VariableUpdate>,
        fault: Option<String>,
    },
}

impl ActivityKind {
    /// Short label used in logs and traces
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sequence => "Sequence",
            Self::Parallel => "Parallel",
            Self::Listen => "Listen",
            Self::EventDriven => "EventDriven",
            Self::EventHandlingScope => "EventHandlingScope",
            Self::EventHandlers => "EventHandlers",
            Self::ConditionedActivityGroup { .. } => "ConditionedActivityGroup",
            Self::Replicator { .. } => "Replicator",
            Self::StateMachine { .. } => "StateMachine",
            Self::State => "State",
            Self::StateInitialization => "StateInitialization",
            Self::StateFinalization => "StateFinalization",
            Self::SetState { .. } => "SetState",
            Self::WaitForEvent { .. } => "WaitForEvent",
            Self::Code { .. } => "Code",
        }
    }

    /// StateMachine roots and nested states
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State | Self::StateMachine { .. })
    }

    pub fn is_composite(&self) -> bool {
        !matches!(
            self,
            Self::SetState { .. } | Self::WaitForEvent { .. } | Self::Code { .. }
        )
    }

    pub fn is_event_activity(&self) -> bool {
        matches!(self, Self::WaitForEvent { .. })
    }
}

// ── Activity Definition ──────────────────────────────────────────────

/// One node of a workflow definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    /// Unique name within the workflow
    pub name: QualifiedName,
    /// Behaviour of this node
    pub kind: ActivityKind,
    /// Disabled activities are skipped by every composite
    pub enabled: bool,
    /// `When` condition, read when the parent is a conditioned activity group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<ActivityCondition>,
    /// Ordered children
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ActivityDefinition>,
}

impl ActivityDefinition {
    pub fn new(name: impl Into<QualifiedName>, kind: ActivityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            when: None,
            children: Vec::new(),
        }
    }

    pub fn sequence(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::Sequence)
    }

    pub fn parallel(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::Parallel)
    }

    pub fn listen(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::Listen)
    }

    pub fn event_driven(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::EventDriven)
    }

    pub fn event_handling_scope(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::EventHandlingScope)
    }

    pub fn event_handlers(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::EventHandlers)
    }

    pub fn conditioned_group(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::ConditionedActivityGroup { until: None })
    }

    pub fn replicator(name: impl Into<QualifiedName>, execution_type: ExecutionType) -> Self {
        Self::new(
            name,
            ActivityKind::Replicator {
                execution_type,
                until: None,
                initial_child_data: Vec::new(),
            },
        )
    }

    pub fn state_machine(
        name: impl Into<QualifiedName>,
        initial_state: impl Into<QualifiedName>,
    ) -> Self {
        Self::new(
            name,
            ActivityKind::StateMachine {
                initial_state: initial_state.into(),
                completed_state: None,
            },
        )
    }

    pub fn state(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::State)
    }

    pub fn state_initialization(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::StateInitialization)
    }

    pub fn state_finalization(name: impl Into<QualifiedName>) -> Self {
        Self::new(name, ActivityKind::StateFinalization)
    }

    pub fn set_state(name: impl Into<QualifiedName>, target: impl Into<QualifiedName>) -> Self {
        Self::new(
            name,
            ActivityKind::SetState {
                target_state: target.into(),
            },
        )
    }

    pub fn wait_for_event(name: impl Into<QualifiedName>, queue: impl Into<QueueName>) -> Self {
        Self::new(
            name,
            ActivityKind::WaitForEvent {
                queue: queue.into(),
            },
        )
    }

    pub fn code(name: impl Into<QualifiedName>) -> Self {
        Self::new(
            name,
            ActivityKind::Code {
                updates: Vec::new(),
                fault: None,
            },
        )
    }

    /// An EventDriven branch listening on `queue`, followed by `body`
    pub fn on_event(
        name: impl Into<QualifiedName>,
        queue: impl Into<QueueName>,
        body: impl IntoIterator<Item = ActivityDefinition>,
    ) -> Self {
        let name = name.into();
        let trigger = Self::wait_for_event(format!("{}.trigger", name), queue);
        Self::event_driven(name)
            .with_child(trigger)
            .with_children(body)
    }

    pub fn with_child(mut self, child: ActivityDefinition) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = ActivityDefinition>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_when(mut self, condition: ActivityCondition) -> Self {
        self.when = Some(condition);
        self
    }

    /// Set the `Until` condition of a conditioned activity group or replicator
    pub fn with_until(mut self, condition: ActivityCondition) -> Self {
        match &mut self.kind {
            ActivityKind::ConditionedActivityGroup { until }
            | ActivityKind::Replicator { until, .. } => *until = Some(condition),
            _ => {}
        }
        self
    }

    pub fn with_initial_child_data(mut self, data: impl IntoIterator<Item = serde_json::Value>) -> Self {
        if let ActivityKind::Replicator {
            initial_child_data, ..
        } = &mut self.kind
        {
            initial_child_data.extend(data);
        }
        self
    }

    pub fn with_completed_state(mut self, state: impl Into<QualifiedName>) -> Self {
        if let ActivityKind::StateMachine {
            completed_state, ..
        } = &mut self.kind
        {
            *completed_state = Some(state.into());
        }
        self
    }

    pub fn with_update(mut self, update: VariableUpdate) -> Self {
        if let ActivityKind::Code { updates, .. } = &mut self.kind {
            updates.push(update);
        }
        self
    }

    pub fn with_fault(mut self, message: impl Into<String>) -> Self {
        if let ActivityKind::Code { fault, .. } = &mut self.kind {
            *fault = Some(message.into());
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn enabled_children(&self) -> impl Iterator<Item = &ActivityDefinition> {
        self.children.iter().filter(|c| c.enabled)
    }

    /// Find a node by name anywhere in this subtree
    pub fn find(&self, name: &str) -> Option<&ActivityDefinition> {
        if self.name.as_str() == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// A state none of whose enabled children is a state
    pub fn is_leaf_state(&self) -> bool {
        self.kind.is_state() && !self.enabled_children().any(|c| c.kind.is_state())
    }

    // ── Validation ───────────────────────────────────────────────────

    /// Validate the structural rules of the whole tree rooted here
    pub fn validate(&self) -> WorkflowResult<()> {
        let mut seen = HashSet::new();
        self.validate_names(&mut seen)?;
        self.validate_node(None)
    }

    /// Validate a subtree about to be inserted under a parent of `parent` kind
    pub fn validate_as_child_of(&self, parent: &ActivityKind) -> WorkflowResult<()> {
        let mut seen = HashSet::new();
        self.validate_names(&mut seen)?;
        self.validate_node(Some(parent))
    }

    /// Every name in this subtree, pre-order
    pub fn names(&self) -> Vec<&QualifiedName> {
        let mut out = vec![&self.name];
        for child in &self.children {
            out.extend(child.names());
        }
        out
    }

    fn validate_names<'a>(&'a self, seen: &mut HashSet<&'a QualifiedName>) -> WorkflowResult<()> {
        if !seen.insert(&self.name) {
            return Err(WorkflowError::DuplicateActivityName(self.name.clone()));
        }
        for child in &self.children {
            child.validate_names(seen)?;
        }
        Ok(())
    }

    fn validate_node(&self, parent: Option<&ActivityKind>) -> WorkflowResult<()> {
        if !self.kind.is_composite() && !self.children.is_empty() {
            return Err(self.invalid("a leaf activity cannot have children"));
        }

        match &self.kind {
            ActivityKind::EventDriven => {
                let first = self.enabled_children().next();
                if !first.map(|c| c.kind.is_event_activity()).unwrap_or(false) {
                    return Err(self.invalid("the first child must be an event activity"));
                }
            }
            ActivityKind::Listen | ActivityKind::EventHandlers => {
                if self
                    .enabled_children()
                    .any(|c| c.kind != ActivityKind::EventDriven)
                {
                    return Err(self.invalid("only EventDriven children are allowed"));
                }
            }
            ActivityKind::EventHandlingScope => {
                let handlers = self
                    .enabled_children()
                    .filter(|c| c.kind == ActivityKind::EventHandlers)
                    .count();
                let bodies = self.enabled_children().count() - handlers;
                if handlers > 1 || bodies > 1 {
                    return Err(self.invalid("expected one body and at most one EventHandlers"));
                }
            }
            ActivityKind::Replicator { .. } => {
                if self.enabled_children().count() != 1 {
                    return Err(self.invalid("a replicator needs exactly one template child"));
                }
            }
            ActivityKind::StateMachine {
                initial_state,
                completed_state,
            } => {
                if parent.map(|p| p.is_state()).unwrap_or(false) {
                    return Err(self.invalid("a state machine cannot be nested in a state"));
                }
                self.validate_state_children()?;
                self.validate_state_reference(initial_state)?;
                if let Some(completed) = completed_state {
                    let state = self.validate_state_reference(completed)?;
                    if state.enabled_children().next().is_some() {
                        return Err(self.invalid("the completed state cannot have children"));
                    }
                }
            }
            ActivityKind::State => {
                if !parent.map(|p| p.is_state()).unwrap_or(false) {
                    return Err(self.invalid("a state must be nested in a state machine"));
                }
                self.validate_state_children()?;
            }
            ActivityKind::StateInitialization | ActivityKind::StateFinalization => {
                if !parent.map(|p| p.is_state()).unwrap_or(false) {
                    return Err(self.invalid("must be a direct child of a state"));
                }
                if self.contains_event_activity() {
                    return Err(self.invalid("cannot contain event activities"));
                }
            }
            _ => {}
        }

        for child in &self.children {
            child.validate_node(Some(&self.kind))?;
        }
        Ok(())
    }

    fn validate_state_children(&self) -> WorkflowResult<()> {
        let mut states = 0;
        let mut initializations = 0;
        let mut finalizations = 0;
        for child in self.enabled_children() {
            match child.kind {
                ActivityKind::State => states += 1,
                ActivityKind::EventDriven => {}
                ActivityKind::StateInitialization => initializations += 1,
                ActivityKind::StateFinalization => finalizations += 1,
                _ => {
                    return Err(self.invalid(&format!(
                        "'{}' ({}) is not allowed inside a state",
                        child.name,
                        child.kind.label()
                    )))
                }
            }
        }
        if states > 0 && (initializations > 0 || finalizations > 0) {
            return Err(self.invalid("only leaf states may have initialization or finalization"));
        }
        if initializations > 1 || finalizations > 1 {
            return Err(self.invalid("at most one initialization and one finalization"));
        }
        Ok(())
    }

    fn validate_state_reference(&self, name: &QualifiedName) -> WorkflowResult<&ActivityDefinition> {
        match self.find(name.as_str()) {
            Some(state) if state.kind == ActivityKind::State && state.is_leaf_state() => Ok(state),
            Some(_) => Err(self.invalid(&format!("'{}' is not a leaf state", name))),
            None => Err(WorkflowError::StateNotFound(name.clone())),
        }
    }

    fn contains_event_activity(&self) -> bool {
        self.kind.is_event_activity() || self.children.iter().any(|c| c.contains_event_activity())
    }

    fn invalid(&self, reason: &str) -> WorkflowError {
        WorkflowError::ValidationError(format!("{} '{}': {}", self.kind.label(), self.name, reason))
    }
}
