//! Workflow runtime: the in-memory host of one workflow instance
//!
//! The runtime owns the activity arena, the work-item scheduler, nested
//! execution contexts, closed-listener registrations, the queuing service
//! and the instance variables. It implements [`ActivityExecutionContext`]
//! for the activity behaviours and exposes the host API: start, deliver
//! events, request state changes, cancel, apply dynamic changes, and query.
//!
//! Work is strictly single threaded. Every behaviour call happens from
//! [`WorkflowRuntime::run`], one work item at a time, in FIFO order.

use crate::activities::{self, behavior_for};
use crate::condition_evaluator::ConditionEvaluator;
use crate::config::RuntimeConfig;
use crate::context::{ActivityExecutionContext, Callback, ExecutionContextManager, WorkItem};
use crate::queuing::{WorkflowQueue, WorkflowQueuingService};
use crate::state_machine::{self, StateMachineExecutionState};
use crate::trace::{ExecutionTrace, TraceEvent};
use crate::tree::{ActivityNode, ActivityTree, NodeState};
use flowstate_types::*;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// How the root activity closed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Completed,
    Canceled,
    Faulted(String),
}

impl std::fmt::Display for WorkflowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Faulted(message) => write!(f, "Faulted: {}", message),
        }
    }
}

/// One running workflow instance
#[derive(Debug)]
pub struct WorkflowRuntime {
    instance_id: WorkflowInstanceId,
    config: RuntimeConfig,
    pub(crate) tree: ActivityTree,
    root: ActivityId,
    scheduler: VecDeque<WorkItem>,
    pub(crate) contexts: ExecutionContextManager,
    closed_listeners: HashMap<ActivityId, Vec<ActivityId>>,
    queuing: WorkflowQueuingService,
    variables: BTreeMap<String, String>,
    trace: ExecutionTrace,
    evaluator: ConditionEvaluator,
    outcome: Option<WorkflowOutcome>,
    started: bool,
}

impl WorkflowRuntime {
    /// Validate a definition and instantiate it
    pub fn new(definition: &ActivityDefinition, config: RuntimeConfig) -> WorkflowResult<Self> {
        definition.validate()?;
        let (tree, root) = ActivityTree::from_definition(definition);
        let mut runtime = Self {
            instance_id: WorkflowInstanceId::generate(),
            trace: ExecutionTrace::new(config.trace_enabled),
            config,
            tree,
            root,
            scheduler: VecDeque::new(),
            contexts: ExecutionContextManager::new(),
            closed_listeners: HashMap::new(),
            queuing: WorkflowQueuingService::new(),
            variables: BTreeMap::new(),
            evaluator: ConditionEvaluator::new(),
            outcome: None,
            started: false,
        };
        runtime.create_event_queues(root);

        tracing::debug!(
            instance_id = %runtime.instance_id,
            root = %definition.name,
            activities = runtime.tree.live_count(),
            "Workflow instance created"
        );
        Ok(runtime)
    }

    /// Seed an instance variable before start
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Create the queue of every event activity in a subtree
    pub(crate) fn create_event_queues(&mut self, from: ActivityId) {
        for id in self.tree.subtree(from) {
            let queue = match self.tree.get(id).map(|n| &n.kind) {
                Some(ActivityKind::WaitForEvent { queue }) => queue.clone(),
                _ => continue,
            };
            if self.queuing.ensure_queue(&queue) {
                self.trace.record(TraceEvent::QueueCreated { queue });
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Schedule the root and run until the instance is idle
    pub fn start(&mut self) -> WorkflowResult<()> {
        if self.started {
            return Err(WorkflowError::InvalidOperation(format!(
                "instance {} already started",
                self.instance_id
            )));
        }
        self.started = true;
        self.trace.record(TraceEvent::InstanceStarted);
        tracing::info!(instance_id = %self.instance_id, "Workflow instance started");

        self.execute_activity(self.root)?;
        self.run()?;
        Ok(())
    }

    /// Process work items until the scheduler is empty. Returns the number
    /// of items processed.
    pub fn run(&mut self) -> WorkflowResult<usize> {
        let limit = self.config.max_work_items_per_run;
        let mut processed = 0;
        while let Some(item) = self.scheduler.pop_front() {
            if processed >= limit {
                self.scheduler.push_front(item);
                tracing::warn!(limit, "Work item limit reached");
                return Err(WorkflowError::WorkLimitExceeded(limit));
            }
            processed += 1;
            self.dispatch(item)?;
        }
        Ok(processed)
    }

    /// Request cancellation of the whole instance
    pub fn cancel(&mut self) -> WorkflowResult<()> {
        self.cancel_activity(self.root)?;
        self.run()?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Put an item on a queue and notify its listeners without running
    pub fn enqueue_item(&mut self, queue: impl Into<QueueName>, payload: serde_json::Value) -> WorkflowResult<()> {
        let queue = queue.into();
        let target = self.queuing.get_queue_mut(&queue)?;
        target.enqueue(payload)?;
        let listeners = target.listeners().to_vec();
        self.trace.record(TraceEvent::ItemEnqueued { queue: queue.clone() });
        tracing::debug!(queue = %queue, listeners = listeners.len(), "Item enqueued");
        for listener in listeners {
            self.scheduler.push_back(WorkItem::QueueItemAvailable {
                listener,
                queue: queue.clone(),
            });
        }
        Ok(())
    }

    /// Deliver an event and run until idle
    pub fn raise_event(&mut self, queue: impl Into<QueueName>, payload: serde_json::Value) -> WorkflowResult<()> {
        self.enqueue_item(queue, payload)?;
        self.run()?;
        Ok(())
    }

    /// Ask the state machine to move to a leaf state
    pub fn set_state(&mut self, target: impl Into<QualifiedName>) -> WorkflowResult<()> {
        let queue = QueueName::new(self.config.set_state_queue_name.clone());
        let payload = SetStateEventArgs::new(target).to_payload();
        self.raise_event(queue, payload)
    }

    // ── Replicator Operations ────────────────────────────────────────

    pub fn replicator_add(&mut self, replicator: &str, data: serde_json::Value) -> WorkflowResult<()> {
        let id = self.resolve_running(replicator)?;
        activities::add_child_data(self, id, data)?;
        self.run()?;
        Ok(())
    }

    pub fn replicator_insert(
        &mut self,
        replicator: &str,
        index: usize,
        data: serde_json::Value,
    ) -> WorkflowResult<()> {
        let id = self.resolve_running(replicator)?;
        activities::insert_child_data(self, id, index, data)?;
        self.run()?;
        Ok(())
    }

    pub fn replicator_remove_at(&mut self, replicator: &str, index: usize) -> WorkflowResult<serde_json::Value> {
        let id = self.resolve_running(replicator)?;
        let removed = activities::remove_child_data_at(self, id, index)?;
        self.run()?;
        Ok(removed)
    }

    pub fn replicator_clear(&mut self, replicator: &str) -> WorkflowResult<()> {
        let id = self.resolve_running(replicator)?;
        activities::clear_child_data(self, id)?;
        self.run()?;
        Ok(())
    }

    pub fn replicator_child_data(&mut self, replicator: &str) -> WorkflowResult<Vec<serde_json::Value>> {
        let id = self.resolve_running(replicator)?;
        activities::child_data(self, id)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn instance_id(&self) -> &WorkflowInstanceId {
        &self.instance_id
    }

    pub fn root(&self) -> ActivityId {
        self.root
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tree(&self) -> &ActivityTree {
        &self.tree
    }

    /// Static activity with this name
    pub fn find_activity(&self, name: &str) -> Option<ActivityId> {
        self.tree.find_by_name(self.root, name)
    }

    pub fn activity(&self, id: ActivityId) -> Option<&ActivityNode> {
        self.tree.get(id)
    }

    /// Status of the static activity with this name
    pub fn status_of(&self, name: &str) -> Option<ExecutionStatus> {
        self.find_activity(name)
            .and_then(|id| self.tree.get(id))
            .map(|n| n.status)
    }

    /// Live clones of an activity running in nested contexts, oldest first
    pub fn get_dynamic_activities(&self, name: &str) -> Vec<ActivityId> {
        let mut records: Vec<_> = self
            .contexts
            .iter()
            .filter(|r| {
                self.tree
                    .get(r.activity)
                    .map(|n| n.name.as_str() == name)
                    .unwrap_or(false)
            })
            .collect();
        records.sort_by_key(|r| r.ordinal);
        records.into_iter().map(|r| r.activity).collect()
    }

    /// Execution state of a state machine root
    pub fn state_machine_state(&self, name: &str) -> Option<&StateMachineExecutionState> {
        let id = self.find_activity(name)?;
        match &self.tree.get(id)?.state {
            NodeState::StateMachine(state) => Some(state.as_ref()),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<&WorkflowOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    pub fn queue(&self, name: &str) -> Option<&WorkflowQueue> {
        self.queuing.get_queue(&QueueName::new(name)).ok()
    }

    pub fn pending_work(&self) -> usize {
        self.scheduler.len()
    }

    /// The newest executing activity with this name, else the static one
    pub(crate) fn resolve_running(&self, name: &str) -> WorkflowResult<ActivityId> {
        self.tree
            .iter()
            .filter(|n| n.name.as_str() == name && n.status.is_running())
            .map(|n| n.id)
            .max()
            .or_else(|| self.find_activity(name))
            .ok_or_else(|| WorkflowError::ActivityNotFound(name.to_string()))
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn dispatch(&mut self, item: WorkItem) -> WorkflowResult<()> {
        let target = item.target();
        let Some(node) = self.tree.get(target) else {
            tracing::trace!(target_id = %target, "Skipping work for removed activity");
            return Ok(());
        };
        let status = node.status;
        let behavior = behavior_for(&node.kind);

        let result = match item {
            WorkItem::Execute(id) => {
                if status != ExecutionStatus::Executing {
                    return Ok(());
                }
                behavior.execute(self, id).and_then(|s| self.settle(id, s))
            }
            WorkItem::Cancel(id) => {
                if status != ExecutionStatus::Canceling {
                    return Ok(());
                }
                behavior.cancel(self, id).and_then(|s| self.settle(id, s))
            }
            WorkItem::Fault(id) => {
                if status != ExecutionStatus::Faulting {
                    return Ok(());
                }
                behavior.handle_fault(self, id).and_then(|s| self.settle(id, s))
            }
            WorkItem::ChildClosed { listener, child } => {
                if status.is_quiescent() || !self.tree.contains(child) {
                    return Ok(());
                }
                behavior.on_child_closed(self, listener, child)
            }
            WorkItem::QueueItemAvailable { listener, queue } => {
                if status != ExecutionStatus::Executing {
                    return Ok(());
                }
                behavior.on_queue_item_available(self, listener, &queue)
            }
            WorkItem::Invoke { target, callback } => {
                if status != ExecutionStatus::Executing {
                    return Ok(());
                }
                self.run_callback(target, callback)
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => self.fault_activity(target, err.to_string()),
        }
    }

    /// Close an activity whose handler reported `Closed`
    fn settle(&mut self, id: ActivityId, returned: ExecutionStatus) -> WorkflowResult<()> {
        let still_running = self.tree.get(id).map(|n| n.status.is_running()).unwrap_or(false);
        if returned == ExecutionStatus::Closed && still_running {
            self.close_activity(id)?;
        }
        Ok(())
    }

    fn run_callback(&mut self, target: ActivityId, callback: Callback) -> WorkflowResult<()> {
        match callback {
            Callback::ProcessStateActions => state_machine::resume_actions(self, target),
            Callback::UnsubscribeAndClose => activities::unsubscribe_and_close(self, target),
            Callback::ReplicatorUpdate => activities::handle_child_update(self, target),
        }
    }

    // ── Faults ───────────────────────────────────────────────────────

    /// Move an activity into `Faulting` after its handler failed
    pub(crate) fn fault_activity(&mut self, id: ActivityId, message: String) -> WorkflowResult<()> {
        let Some(node) = self.tree.get_mut(id) else {
            return Ok(());
        };
        let status = node.status;
        let parent = node.parent;
        match status {
            ExecutionStatus::Executing | ExecutionStatus::Canceling => {
                node.status = ExecutionStatus::Faulting;
                node.fault = Some(message.clone());
                let name = node.name.clone();
                tracing::warn!(activity = %name, error = %message, "Activity faulted");
                self.trace.record_status(&name, id, ExecutionStatus::Faulting);
                self.trace.record(TraceEvent::FaultRaised {
                    activity: name,
                    message,
                });
                self.scheduler.push_back(WorkItem::Fault(id));
                Ok(())
            }
            ExecutionStatus::Faulting => {
                node.fault = Some(message);
                self.force_close(id)
            }
            ExecutionStatus::Initialized | ExecutionStatus::Closed => match parent {
                Some(parent) => self.fault_activity(parent, message),
                None => {
                    self.outcome = Some(WorkflowOutcome::Faulted(message));
                    Ok(())
                }
            },
        }
    }

    /// Fault handling itself failed: abandon everything underneath and close
    fn force_close(&mut self, id: ActivityId) -> WorkflowResult<()> {
        for descendant in self.tree.subtree(id).into_iter().skip(1) {
            self.abandon(descendant);
        }
        for clone in self.nested_contexts(id) {
            if self.tree.get(clone).map(|n| n.status.is_running()).unwrap_or(false) {
                self.abandon(clone);
            }
            self.purge_subtree(clone);
        }
        self.close_activity(id)
    }

    /// Mark a running node closed without notifying anyone
    pub(crate) fn abandon(&mut self, id: ActivityId) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        if !node.status.is_running() {
            return;
        }
        node.status = ExecutionStatus::Closed;
        node.result = ExecutionResult::Canceled;
        let name = node.name.clone();
        self.closed_listeners.remove(&id);
        self.queuing.remove_listener_everywhere(id);
        self.trace.record(TraceEvent::ActivityAbandoned { activity: name, id });
    }

    /// Contexts owned by any node of the subtree rooted at `id`
    fn nested_contexts(&self, id: ActivityId) -> Vec<ActivityId> {
        self.tree
            .subtree(id)
            .into_iter()
            .flat_map(|n| self.contexts.owned_by(n))
            .collect()
    }

    /// Drop a subtree, its nested contexts, and its registrations
    pub(crate) fn purge_subtree(&mut self, id: ActivityId) {
        for clone in self.nested_contexts(id) {
            self.purge_subtree(clone);
        }
        for node in self.tree.subtree(id) {
            self.closed_listeners.remove(&node);
            self.queuing.remove_listener_everywhere(node);
            self.contexts.remove(node);
            self.tree.remove(node);
        }
    }
}

impl ActivityExecutionContext for WorkflowRuntime {
    fn tree(&self) -> &ActivityTree {
        &self.tree
    }

    fn tree_mut(&mut self) -> &mut ActivityTree {
        &mut self.tree
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ── Activity Lifecycle ───────────────────────────────────────────

    fn execute_activity(&mut self, activity: ActivityId) -> WorkflowResult<()> {
        let node = self.tree.node_mut(activity)?;
        if node.status != ExecutionStatus::Initialized {
            return Err(WorkflowError::InvalidOperation(format!(
                "cannot execute '{}' in status {}",
                node.name, node.status
            )));
        }
        node.status = ExecutionStatus::Executing;
        let name = node.name.clone();
        tracing::debug!(activity = %name, "Activity scheduled");
        self.trace.record_status(&name, activity, ExecutionStatus::Executing);
        self.scheduler.push_back(WorkItem::Execute(activity));
        Ok(())
    }

    fn cancel_activity(&mut self, activity: ActivityId) -> WorkflowResult<()> {
        let node = self.tree.node_mut(activity)?;
        match node.status {
            ExecutionStatus::Executing => {
                node.status = ExecutionStatus::Canceling;
                let name = node.name.clone();
                tracing::debug!(activity = %name, "Cancellation requested");
                self.trace.record_status(&name, activity, ExecutionStatus::Canceling);
                self.scheduler.push_back(WorkItem::Cancel(activity));
                Ok(())
            }
            ExecutionStatus::Canceling | ExecutionStatus::Faulting => Ok(()),
            status => Err(WorkflowError::InvalidOperation(format!(
                "cannot cancel '{}' in status {}",
                node.name, status
            ))),
        }
    }

    fn close_activity(&mut self, activity: ActivityId) -> WorkflowResult<()> {
        let node = self.tree.node(activity)?;
        let status = node.status;
        if !status.is_running() {
            return Err(WorkflowError::InvalidOperation(format!(
                "cannot close '{}' in status {}",
                node.name, status
            )));
        }
        for child in self.tree.enabled_children(activity) {
            if self.tree.status(child)?.is_running() {
                return Err(WorkflowError::InvalidOperation(format!(
                    "cannot close '{}' while child '{}' is running",
                    node.name,
                    self.tree.name(child)?
                )));
            }
        }
        for clone in self.contexts.owned_by(activity) {
            if self.tree.status(clone)?.is_running() {
                return Err(WorkflowError::InvalidOperation(format!(
                    "cannot close '{}' while nested context '{}' is running",
                    node.name,
                    self.tree.name(clone)?
                )));
            }
        }
        for clone in self.contexts.owned_by(activity) {
            self.purge_subtree(clone);
        }

        let result = ExecutionResult::closing_from(status);
        let node = self.tree.node_mut(activity)?;
        node.status = ExecutionStatus::Closed;
        node.result = result;
        let name = node.name.clone();
        let message = node.fault.clone().unwrap_or_default();
        let parent = node.parent;
        tracing::debug!(activity = %name, result = ?result, "Activity closed");
        self.trace.record_status(&name, activity, ExecutionStatus::Closed);

        if result == ExecutionResult::Faulted {
            if let Some(parent) = parent {
                self.propagate_fault(parent, &message)?;
            }
        }

        for listener in self.closed_listeners.remove(&activity).unwrap_or_default() {
            self.scheduler.push_back(WorkItem::ChildClosed {
                listener,
                child: activity,
            });
        }

        if activity == self.root {
            let outcome = match result {
                ExecutionResult::Canceled => WorkflowOutcome::Canceled,
                ExecutionResult::Faulted => WorkflowOutcome::Faulted(message),
                _ => WorkflowOutcome::Completed,
            };
            tracing::info!(instance_id = %self.instance_id, outcome = %outcome, "Workflow instance closed");
            self.trace.record(TraceEvent::InstanceClosed {
                outcome: outcome.to_string(),
            });
            self.outcome = Some(outcome);
        }
        Ok(())
    }

    // ── Execution Contexts ───────────────────────────────────────────

    fn create_execution_context(&mut self, template: ActivityId) -> WorkflowResult<ActivityId> {
        let owner = self.tree.parent(template).ok_or_else(|| {
            WorkflowError::InvalidOperation(format!("template {} has no owner", template))
        })?;
        let clone = self.tree.clone_subtree(template)?;
        self.contexts.insert(owner, template, clone);

        let owner_name = self.tree.name(owner)?.clone();
        let activity = self.tree.name(clone)?.clone();
        tracing::debug!(owner = %owner_name, activity = %activity, "Execution context created");
        self.trace.record(TraceEvent::ContextCreated {
            owner: owner_name,
            activity,
            id: clone,
        });
        Ok(clone)
    }

    fn get_execution_context(&self, owner: ActivityId, name: &QualifiedName) -> Option<ActivityId> {
        self.contexts
            .owned_by(owner)
            .into_iter()
            .find(|c| self.tree.get(*c).map(|n| &n.name == name).unwrap_or(false))
    }

    fn complete_execution_context(&mut self, activity: ActivityId) -> WorkflowResult<()> {
        if self.contexts.get(activity).is_none() {
            return Err(WorkflowError::InvalidOperation(format!(
                "{} is not a nested execution context",
                activity
            )));
        }
        let node = self.tree.node(activity)?;
        if node.status.is_running() {
            return Err(WorkflowError::InvalidOperation(format!(
                "cannot complete context of running '{}'",
                node.name
            )));
        }
        let name = node.name.clone();
        self.trace.record(TraceEvent::ContextCompleted { activity: name, id: activity });
        self.purge_subtree(activity);
        Ok(())
    }

    fn execution_contexts(&self, owner: ActivityId) -> Vec<ActivityId> {
        self.contexts.owned_by(owner)
    }

    // ── Listeners ────────────────────────────────────────────────────

    fn register_for_closed(&mut self, activity: ActivityId, listener: ActivityId) {
        let listeners = self.closed_listeners.entry(activity).or_default();
        if !listeners.contains(&listener) {
            listeners.push(listener);
        }
    }

    fn unregister_for_closed(&mut self, activity: ActivityId, listener: ActivityId) {
        if let Some(listeners) = self.closed_listeners.get_mut(&activity) {
            listeners.retain(|l| *l != listener);
        }
    }

    // ── Queues ───────────────────────────────────────────────────────

    fn queuing_service(&self) -> &WorkflowQueuingService {
        &self.queuing
    }

    fn queuing_service_mut(&mut self) -> &mut WorkflowQueuingService {
        &mut self.queuing
    }

    fn register_for_queue_item_available(&mut self, queue: &QueueName, listener: ActivityId) -> WorkflowResult<()> {
        let target = self.queuing.get_queue_mut(queue)?;
        if !target.add_listener(listener) {
            return Ok(());
        }
        let held = target.count();
        let name = self.tree.name(listener)?.clone();
        self.trace.record(TraceEvent::ListenerRegistered {
            queue: queue.clone(),
            listener: name,
        });
        for _ in 0..held {
            self.scheduler.push_back(WorkItem::QueueItemAvailable {
                listener,
                queue: queue.clone(),
            });
        }
        Ok(())
    }

    fn unregister_for_queue_item_available(&mut self, queue: &QueueName, listener: ActivityId) {
        let removed = self
            .queuing
            .get_queue_mut(queue)
            .map(|q| q.remove_listener(listener))
            .unwrap_or(false);
        if removed {
            if let Ok(name) = self.tree.name(listener) {
                let listener = name.clone();
                self.trace.record(TraceEvent::ListenerUnregistered {
                    queue: queue.clone(),
                    listener,
                });
            }
        }
    }

    fn dequeue_item(&mut self, queue: &QueueName, activity: ActivityId) -> WorkflowResult<Option<serde_json::Value>> {
        let item = self.queuing.get_queue_mut(queue)?.dequeue();
        if item.is_some() {
            let name = self.tree.name(activity)?.clone();
            self.trace.record(TraceEvent::ItemDequeued {
                queue: queue.clone(),
                activity: name,
            });
        }
        Ok(item)
    }

    fn set_queue_enabled(&mut self, queue: &QueueName, enabled: bool) -> WorkflowResult<()> {
        let target = self.queuing.get_queue_mut(queue)?;
        if target.is_enabled() != enabled {
            target.set_enabled(enabled);
            self.trace.record(TraceEvent::QueueEnabledChanged {
                queue: queue.clone(),
                enabled,
            });
        }
        Ok(())
    }

    fn invoke(&mut self, target: ActivityId, callback: Callback) {
        self.scheduler.push_back(WorkItem::Invoke { target, callback });
    }

    // ── Variables ────────────────────────────────────────────────────

    fn evaluate(&self, condition: &ActivityCondition) -> bool {
        self.evaluator.evaluate(condition, &self.variables)
    }

    fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    fn set_variable(&mut self, name: &str, value: String) {
        tracing::debug!(variable = name, value = %value, "Variable updated");
        self.trace.record_variable(name, &value);
        self.variables.insert(name.to_string(), value);
    }

    fn trace_mut(&mut self) -> &mut ExecutionTrace {
        &mut self.trace
    }
}

impl WorkflowRuntime {
    /// A child closed faulted: its parent starts faulting, unless it already is
    fn propagate_fault(&mut self, parent: ActivityId, message: &str) -> WorkflowResult<()> {
        let Some(node) = self.tree.get_mut(parent) else {
            return Ok(());
        };
        if !matches!(node.status, ExecutionStatus::Executing | ExecutionStatus::Canceling) {
            return Ok(());
        }
        node.status = ExecutionStatus::Faulting;
        node.fault = Some(message.to_string());
        let name = node.name.clone();
        tracing::warn!(activity = %name, error = %message, "Fault propagated");
        self.trace.record_status(&name, parent, ExecutionStatus::Faulting);
        self.scheduler.push_back(WorkItem::Fault(parent));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(name: &str) -> ActivityDefinition {
        ActivityDefinition::code(name)
    }

    #[test]
    fn test_sequence_runs_to_completion() {
        let def = ActivityDefinition::sequence("root")
            .with_child(code("a").with_update(VariableUpdate::increment("count")))
            .with_child(code("b").with_update(VariableUpdate::increment("count")));
        let mut runtime = WorkflowRuntime::new(&def, RuntimeConfig::default()).unwrap();
        runtime.start().unwrap();

        assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
        assert_eq!(runtime.variable("count"), Some("2"));
        assert_eq!(
            runtime.trace().execution_order(),
            vec![QualifiedName::new("root"), "a".into(), "b".into()]
        );
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut runtime = WorkflowRuntime::new(&code("only"), RuntimeConfig::default()).unwrap();
        runtime.start().unwrap();
        assert!(matches!(runtime.start(), Err(WorkflowError::InvalidOperation(_))));
    }

    #[test]
    fn test_event_waits_for_item() {
        let def = ActivityDefinition::sequence("root")
            .with_child(ActivityDefinition::wait_for_event("wait", "orders"));
        let mut runtime = WorkflowRuntime::new(&def, RuntimeConfig::default()).unwrap();
        runtime.start().unwrap();
        assert!(runtime.outcome().is_none());
        assert_eq!(runtime.queue("orders").unwrap().listeners().len(), 1);

        runtime.raise_event("orders", json!({ "id": 7 })).unwrap();
        assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
        assert!(runtime.queue("orders").unwrap().listeners().is_empty());
    }

    #[test]
    fn test_unknown_queue_rejected() {
        let mut runtime = WorkflowRuntime::new(&code("only"), RuntimeConfig::default()).unwrap();
        let result = runtime.enqueue_item("missing", json!(null));
        assert!(matches!(result, Err(WorkflowError::QueueNotFound(_))));
    }

    #[test]
    fn test_fault_closes_root_faulted() {
        let def = ActivityDefinition::sequence("root")
            .with_child(code("boom").with_fault("disk full"))
            .with_child(code("after"));
        let mut runtime = WorkflowRuntime::new(&def, RuntimeConfig::default()).unwrap();
        runtime.start().unwrap();

        match runtime.outcome() {
            Some(WorkflowOutcome::Faulted(message)) => assert!(message.contains("disk full")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(runtime.status_of("after"), Some(ExecutionStatus::Initialized));
    }

    #[test]
    fn test_cancel_waiting_instance() {
        let def = ActivityDefinition::parallel("root")
            .with_child(ActivityDefinition::wait_for_event("left", "l"))
            .with_child(ActivityDefinition::wait_for_event("right", "r"));
        let mut runtime = WorkflowRuntime::new(&def, RuntimeConfig::default()).unwrap();
        runtime.start().unwrap();
        runtime.cancel().unwrap();

        assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Canceled));
        assert!(runtime.queue("l").unwrap().listeners().is_empty());
        assert!(runtime.queue("r").unwrap().listeners().is_empty());
    }

    #[test]
    fn test_work_limit() {
        let def = ActivityDefinition::conditioned_group("loop")
            .with_child(code("spin").with_when(ActivityCondition::Constant(true)));
        let config = RuntimeConfig::default().with_max_work_items_per_run(50);
        let mut runtime = WorkflowRuntime::new(&def, config).unwrap();
        assert!(matches!(runtime.start(), Err(WorkflowError::WorkLimitExceeded(50))));
    }
}
