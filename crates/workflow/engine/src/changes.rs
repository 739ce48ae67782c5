//! Dynamic update: structural changes applied to a running instance
//!
//! A batch of [`StructuralChange`]s is applied in order. Each composite
//! whose child list changed is told about every addition or removal, and
//! once the whole batch is in place it gets one `on_changes_completed`
//! call so it can reschedule. The runtime then runs until idle.

use crate::activities::behavior_for;
use crate::context::{ActivityExecutionContext, RemovedActivity};
use crate::runtime::WorkflowRuntime;
use flowstate_types::*;
use serde::{Deserialize, Serialize};

/// One edit of the running activity tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StructuralChange {
    /// Insert a new subtree at `index` among the children of `parent`
    Add {
        parent: QualifiedName,
        index: usize,
        activity: ActivityDefinition,
    },
    /// Remove an activity and everything beneath it
    Remove { activity: QualifiedName },
}

impl StructuralChange {
    pub fn add(parent: impl Into<QualifiedName>, index: usize, activity: ActivityDefinition) -> Self {
        Self::Add {
            parent: parent.into(),
            index,
            activity,
        }
    }

    pub fn remove(activity: impl Into<QualifiedName>) -> Self {
        Self::Remove {
            activity: activity.into(),
        }
    }
}

impl WorkflowRuntime {
    /// Apply a batch of structural changes, then run until idle
    pub fn apply_changes(&mut self, changes: Vec<StructuralChange>) -> WorkflowResult<()> {
        let mut touched: Vec<ActivityId> = Vec::new();
        for change in changes {
            let parent = match change {
                StructuralChange::Add {
                    parent,
                    index,
                    activity,
                } => self.apply_add(&parent, index, &activity)?,
                StructuralChange::Remove { activity } => self.apply_remove(&activity)?,
            };
            if !touched.contains(&parent) {
                touched.push(parent);
            }
        }

        for parent in touched {
            let Some(node) = self.tree.get(parent) else {
                continue;
            };
            if !node.status.is_running() {
                continue;
            }
            let behavior = behavior_for(&node.kind);
            if let Err(err) = behavior.on_changes_completed(self, parent) {
                self.fault_activity(parent, err.to_string())?;
            }
        }
        self.run()?;
        Ok(())
    }

    fn apply_add(
        &mut self,
        parent_name: &QualifiedName,
        index: usize,
        definition: &ActivityDefinition,
    ) -> WorkflowResult<ActivityId> {
        let parent = self.resolve_running(parent_name.as_str())?;
        let parent_kind = self.tree.node(parent)?.kind.clone();
        if !parent_kind.is_composite() {
            return Err(WorkflowError::InvalidOperation(format!(
                "'{}' cannot have children",
                parent_name
            )));
        }
        definition.validate_as_child_of(&parent_kind)?;
        for name in definition.names() {
            if self.tree.iter().any(|n| &n.name == name) {
                return Err(WorkflowError::DuplicateActivityName(name.clone()));
            }
        }

        let added = self.tree.insert_child(parent, index, definition)?;
        self.create_event_queues(added);
        tracing::info!(
            parent = %parent_name,
            activity = %definition.name,
            index,
            "Activity added"
        );

        let node = self.tree.node(parent)?;
        if node.status.is_running() {
            let behavior = behavior_for(&node.kind);
            if let Err(err) = behavior.on_activity_added(self, parent, added) {
                self.fault_activity(parent, err.to_string())?;
            }
        }
        Ok(parent)
    }

    fn apply_remove(&mut self, name: &QualifiedName) -> WorkflowResult<ActivityId> {
        let target = self.resolve_removal_target(name)?;
        let node = self.tree.node(target)?;
        let parent = node.parent.ok_or_else(|| {
            WorkflowError::InvalidOperation(format!("cannot remove root activity '{}'", name))
        })?;
        let kind_label = node.kind.label();
        let event_queue = match node.kind {
            ActivityKind::EventDriven => self.event_queue_of(target).ok(),
            _ => None,
        };

        let clones = self.contexts.cloned_from(target);
        let mut was_running = node.status.is_running();
        for clone in &clones {
            was_running |= self.tree.status(*clone)?.is_running();
        }

        for clone in clones {
            self.abandon_subtree(clone);
            self.purge_subtree(clone);
        }
        self.abandon_subtree(target);
        self.tree.detach(target);
        self.purge_subtree(target);
        tracing::info!(activity = %name, kind = kind_label, was_running, "Activity removed");

        let removed = RemovedActivity {
            name: name.clone(),
            kind_label,
            event_queue,
            was_running,
        };
        let node = self.tree.node(parent)?;
        if node.status.is_running() {
            let behavior = behavior_for(&node.kind);
            if let Err(err) = behavior.on_activity_removed(self, parent, &removed) {
                self.fault_activity(parent, err.to_string())?;
            }
        }
        Ok(parent)
    }

    /// A listed child with this name under a running parent, else the static one
    fn resolve_removal_target(&self, name: &QualifiedName) -> WorkflowResult<ActivityId> {
        self.tree
            .iter()
            .filter(|n| &n.name == name && self.contexts.get(n.id).is_none())
            .filter(|n| {
                n.parent
                    .and_then(|p| self.tree.get(p))
                    .map(|p| p.status.is_running())
                    .unwrap_or(false)
            })
            .map(|n| n.id)
            .max()
            .or_else(|| self.find_activity(name.as_str()))
            .ok_or_else(|| WorkflowError::ActivityNotFound(name.to_string()))
    }

    fn abandon_subtree(&mut self, id: ActivityId) {
        for node in self.tree.subtree(id) {
            self.abandon(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::WorkflowOutcome;

    #[test]
    fn test_add_child_to_waiting_sequence() {
        let def = ActivityDefinition::sequence("root")
            .with_child(ActivityDefinition::wait_for_event("wait", "go"));
        let mut runtime = WorkflowRuntime::new(&def, RuntimeConfig::default()).unwrap();
        runtime.start().unwrap();

        let extra = ActivityDefinition::code("extra").with_update(VariableUpdate::set("ran", "yes"));
        runtime
            .apply_changes(vec![StructuralChange::add("root", 1, extra)])
            .unwrap();
        runtime.raise_event("go", serde_json::json!(true)).unwrap();

        assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
        assert_eq!(runtime.variable("ran"), Some("yes"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let def = ActivityDefinition::sequence("root").with_child(ActivityDefinition::code("a"));
        let mut runtime = WorkflowRuntime::new(&def, RuntimeConfig::default()).unwrap();
        let result = runtime.apply_changes(vec![StructuralChange::add("root", 0, ActivityDefinition::code("a"))]);
        assert!(matches!(result, Err(WorkflowError::DuplicateActivityName(_))));
    }

    #[test]
    fn test_remove_root_rejected() {
        let def = ActivityDefinition::sequence("root");
        let mut runtime = WorkflowRuntime::new(&def, RuntimeConfig::default()).unwrap();
        let result = runtime.apply_changes(vec![StructuralChange::remove("root")]);
        assert!(matches!(result, Err(WorkflowError::InvalidOperation(_))));
    }

    #[test]
    fn test_change_serde() {
        let change = StructuralChange::remove("a");
        let json = serde_json::to_string(&change).unwrap();
        let back: StructuralChange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }
}
