//! The activity execution context contract
//!
//! Composite activities never touch the scheduler directly. They drive
//! their children through [`ActivityExecutionContext`]: execute, cancel and
//! close activities, create and complete nested execution contexts, and
//! register for closure and queue notifications. [`WorkflowRuntime`]
//! is the in-memory implementation.
//!
//! [`WorkflowRuntime`]: crate::WorkflowRuntime

use crate::config::RuntimeConfig;
use crate::queuing::WorkflowQueuingService;
use crate::trace::ExecutionTrace;
use crate::tree::ActivityTree;
use flowstate_types::*;
use std::collections::{BTreeMap, HashMap};

// ── Work Items ───────────────────────────────────────────────────────

/// Deferred callbacks an activity can schedule on another activity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callback {
    /// Resume draining the state machine action queue in this state
    ProcessStateActions,
    /// Ask an EventHandlers activity to stop listening and close when idle
    UnsubscribeAndClose,
    /// Start replicator iterations made runnable by a host list change
    ReplicatorUpdate,
}

/// One unit of scheduler work
#[derive(Clone, Debug, PartialEq)]
pub enum WorkItem {
    Execute(ActivityId),
    Cancel(ActivityId),
    Fault(ActivityId),
    ChildClosed {
        listener: ActivityId,
        child: ActivityId,
    },
    QueueItemAvailable {
        listener: ActivityId,
        queue: QueueName,
    },
    Invoke {
        target: ActivityId,
        callback: Callback,
    },
}

impl WorkItem {
    /// The activity whose handler runs for this item
    pub fn target(&self) -> ActivityId {
        match self {
            Self::Execute(id) | Self::Cancel(id) | Self::Fault(id) => *id,
            Self::ChildClosed { listener, .. } | Self::QueueItemAvailable { listener, .. } => *listener,
            Self::Invoke { target, .. } => *target,
        }
    }
}

// ── Execution Contexts ───────────────────────────────────────────────

/// A nested execution context: a fresh clone of a template activity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextRecord {
    /// The composite whose context manager owns this context
    pub owner: ActivityId,
    /// The activity the clone was made from
    pub template: ActivityId,
    /// Root of the cloned subtree
    pub activity: ActivityId,
    /// Creation order among all contexts
    pub ordinal: u64,
}

/// Live nested contexts, keyed by the clone's handle
#[derive(Clone, Debug, Default)]
pub struct ExecutionContextManager {
    records: HashMap<ActivityId, ContextRecord>,
    next_ordinal: u64,
}

impl ExecutionContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, owner: ActivityId, template: ActivityId, activity: ActivityId) {
        let record = ContextRecord {
            owner,
            template,
            activity,
            ordinal: self.next_ordinal,
        };
        self.next_ordinal += 1;
        self.records.insert(activity, record);
    }

    pub fn get(&self, activity: ActivityId) -> Option<&ContextRecord> {
        self.records.get(&activity)
    }

    pub fn remove(&mut self, activity: ActivityId) -> Option<ContextRecord> {
        self.records.remove(&activity)
    }

    /// Contexts owned by `owner`, oldest first
    pub fn owned_by(&self, owner: ActivityId) -> Vec<ActivityId> {
        let mut owned: Vec<&ContextRecord> = self.records.values().filter(|r| r.owner == owner).collect();
        owned.sort_by_key(|r| r.ordinal);
        owned.into_iter().map(|r| r.activity).collect()
    }

    /// Contexts cloned from `template`, oldest first
    pub fn cloned_from(&self, template: ActivityId) -> Vec<ActivityId> {
        let mut cloned: Vec<&ContextRecord> = self.records.values().filter(|r| r.template == template).collect();
        cloned.sort_by_key(|r| r.ordinal);
        cloned.into_iter().map(|r| r.activity).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextRecord> {
        self.records.values()
    }
}

/// What a composite learns about a child removed by a dynamic update
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedActivity {
    pub name: QualifiedName,
    pub kind_label: &'static str,
    /// Queue of the event activity if the removed child was an EventDriven branch
    pub event_queue: Option<QueueName>,
    /// The child, or one of its clones, was running and has been abandoned
    pub was_running: bool,
}

// ── Contract ─────────────────────────────────────────────────────────

/// Services the runtime provides to activity behaviours
pub trait ActivityExecutionContext {
    fn tree(&self) -> &ActivityTree;
    fn tree_mut(&mut self) -> &mut ActivityTree;
    fn config(&self) -> &RuntimeConfig;

    /// Schedule an `Initialized` activity. Its status becomes `Executing` now.
    fn execute_activity(&mut self, activity: ActivityId) -> WorkflowResult<()>;
    /// Request cancellation of an `Executing` activity
    fn cancel_activity(&mut self, activity: ActivityId) -> WorkflowResult<()>;
    /// Close a running activity whose children are all quiescent
    fn close_activity(&mut self, activity: ActivityId) -> WorkflowResult<()>;

    /// Clone `template` into a new nested context owned by its parent
    fn create_execution_context(&mut self, template: ActivityId) -> WorkflowResult<ActivityId>;
    /// Live context owned by `owner` whose activity carries `name`
    fn get_execution_context(&self, owner: ActivityId, name: &QualifiedName) -> Option<ActivityId>;
    /// Destroy a quiescent context and everything beneath it
    fn complete_execution_context(&mut self, activity: ActivityId) -> WorkflowResult<()>;
    /// Live contexts owned by `owner`, oldest first
    fn execution_contexts(&self, owner: ActivityId) -> Vec<ActivityId>;

    fn register_for_closed(&mut self, activity: ActivityId, listener: ActivityId);
    fn unregister_for_closed(&mut self, activity: ActivityId, listener: ActivityId);

    fn queuing_service(&self) -> &WorkflowQueuingService;
    fn queuing_service_mut(&mut self) -> &mut WorkflowQueuingService;
    /// Register a listener; items already held produce one notification each
    fn register_for_queue_item_available(
        &mut self,
        queue: &QueueName,
        listener: ActivityId,
    ) -> WorkflowResult<()>;
    fn unregister_for_queue_item_available(&mut self, queue: &QueueName, listener: ActivityId);
    /// Take the next item from a queue on behalf of an activity
    fn dequeue_item(
        &mut self,
        queue: &QueueName,
        activity: ActivityId,
    ) -> WorkflowResult<Option<serde_json::Value>>;
    /// Enable or disable a queue
    fn set_queue_enabled(&mut self, queue: &QueueName, enabled: bool) -> WorkflowResult<()>;

    /// Schedule a callback on another activity
    fn invoke(&mut self, target: ActivityId, callback: Callback);

    fn evaluate(&self, condition: &ActivityCondition) -> bool;
    fn variables(&self) -> &BTreeMap<String, String>;
    fn set_variable(&mut self, name: &str, value: String);

    fn trace_mut(&mut self) -> &mut ExecutionTrace;

    // ── Provided helpers ─────────────────────────────────────────────

    fn status(&self, activity: ActivityId) -> WorkflowResult<ExecutionStatus> {
        self.tree().status(activity)
    }

    fn name_of(&self, activity: ActivityId) -> WorkflowResult<QualifiedName> {
        Ok(self.tree().name(activity)?.clone())
    }

    fn enabled_children(&self, activity: ActivityId) -> Vec<ActivityId> {
        self.tree().enabled_children(activity)
    }

    /// Queue name of an EventDriven branch's leading event activity
    fn event_queue_of(&self, event_driven: ActivityId) -> WorkflowResult<QueueName> {
        let first = self.enabled_children(event_driven).into_iter().next();
        match first.and_then(|id| self.tree().get(id)).map(|n| &n.kind) {
            Some(ActivityKind::WaitForEvent { queue }) => Ok(queue.clone()),
            _ => Err(WorkflowError::InvalidOperation(format!(
                "'{}' does not start with an event activity",
                self.name_of(event_driven)?
            ))),
        }
    }

    /// Subscribe `listener` to the event activity of an EventDriven branch
    fn subscribe_event(&mut self, event_driven: ActivityId, listener: ActivityId) -> WorkflowResult<QueueName> {
        let queue = self.event_queue_of(event_driven)?;
        self.queuing_service_mut().ensure_queue(&queue);
        self.register_for_queue_item_available(&queue, listener)?;
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_manager_ordering() {
        let mut manager = ExecutionContextManager::new();
        manager.insert(ActivityId(1), ActivityId(2), ActivityId(10));
        manager.insert(ActivityId(1), ActivityId(3), ActivityId(11));
        manager.insert(ActivityId(4), ActivityId(2), ActivityId(12));

        assert_eq!(manager.owned_by(ActivityId(1)), vec![ActivityId(10), ActivityId(11)]);
        assert_eq!(manager.cloned_from(ActivityId(2)), vec![ActivityId(10), ActivityId(12)]);

        manager.remove(ActivityId(10));
        assert_eq!(manager.owned_by(ActivityId(1)), vec![ActivityId(11)]);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_work_item_target() {
        let item = WorkItem::ChildClosed {
            listener: ActivityId(1),
            child: ActivityId(2),
        };
        assert_eq!(item.target(), ActivityId(1));
        assert_eq!(WorkItem::Cancel(ActivityId(5)).target(), ActivityId(5));
    }
}
