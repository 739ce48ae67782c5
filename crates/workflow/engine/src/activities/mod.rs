//! Activity behaviours
//!
//! Each activity kind implements [`ActivityBehavior`]. The runtime looks the
//! behaviour up from the node's [`ActivityKind`] and calls into it when a
//! work item for that node is dispatched. Behaviours are stateless; their
//! runtime state lives on the node as a [`NodeState`](crate::tree::NodeState)
//! variant.

use crate::context::{ActivityExecutionContext, RemovedActivity};
use crate::state_machine::StateActivity;
use flowstate_types::*;

/// Generates an accessor that borrows one `NodeState` variant of a node,
/// installing the variant's default on first use
macro_rules! node_state_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub(crate) fn $fn_name(
            ctx: &mut dyn $crate::context::ActivityExecutionContext,
            activity: flowstate_types::ActivityId,
        ) -> flowstate_types::WorkflowResult<&mut $ty> {
            let node = ctx.tree_mut().node_mut(activity)?;
            if !matches!(node.state, $crate::tree::NodeState::$variant(_)) {
                node.state = $crate::tree::NodeState::$variant(<$ty>::default());
            }
            match &mut node.state {
                $crate::tree::NodeState::$variant(state) => Ok(state),
                _ => Err(flowstate_types::WorkflowError::InvalidOperation(format!(
                    "runtime state of {} is not {}",
                    activity,
                    stringify!($variant)
                ))),
            }
        }
    };
}

pub(crate) use node_state_accessor;

mod cag;
mod event_handling;
mod leaf;
mod listen;
mod parallel;
mod replicator;
mod sequence;

pub use cag::{CagChildState, CagChildStats, CagState, ConditionedActivityGroup};
pub use event_handling::{
    unsubscribe_and_close, EventHandlerSubscriber, EventHandlersActivity, EventHandlersState,
    EventHandlingScopeActivity,
};
pub use leaf::{CodeActivity, EventState, SetStateActivity, WaitForEventActivity};
pub use listen::{ListenActivity, ListenState, ListenSubscription};
pub use parallel::ParallelActivity;
pub use replicator::{
    ChildExecutionStateInfo, ChildRunStatus, ReplicatorActivity, ReplicatorStateInfo,
};
pub use sequence::{SequenceActivity, SequenceState};

pub(crate) use replicator::{
    add_child_data, child_data, clear_child_data, handle_child_update, insert_child_data,
    remove_child_data_at,
};

/// Lifecycle hooks of one activity kind
pub trait ActivityBehavior: Sync {
    /// Start executing. Returning `Closed` closes the activity.
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus>;

    /// Cancellation was requested. Returning `Closed` closes the activity.
    fn cancel(
        &self,
        _ctx: &mut dyn ActivityExecutionContext,
        _activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        Ok(ExecutionStatus::Closed)
    }

    /// The activity is faulting. Composites drive their children to closure.
    fn handle_fault(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        self.cancel(ctx, activity)
    }

    /// A child this activity registered for has closed
    fn on_child_closed(
        &self,
        _ctx: &mut dyn ActivityExecutionContext,
        _activity: ActivityId,
        _child: ActivityId,
    ) -> WorkflowResult<()> {
        Ok(())
    }

    /// An item is available on a queue this activity listens to
    fn on_queue_item_available(
        &self,
        _ctx: &mut dyn ActivityExecutionContext,
        _activity: ActivityId,
        _queue: &QueueName,
    ) -> WorkflowResult<()> {
        Ok(())
    }

    /// A dynamic update inserted a child
    fn on_activity_added(
        &self,
        _ctx: &mut dyn ActivityExecutionContext,
        _activity: ActivityId,
        _added: ActivityId,
    ) -> WorkflowResult<()> {
        Ok(())
    }

    /// A dynamic update removed a child
    fn on_activity_removed(
        &self,
        _ctx: &mut dyn ActivityExecutionContext,
        _activity: ActivityId,
        _removed: &RemovedActivity,
    ) -> WorkflowResult<()> {
        Ok(())
    }

    /// A batch of dynamic changes touching this activity has been applied
    fn on_changes_completed(
        &self,
        _ctx: &mut dyn ActivityExecutionContext,
        _activity: ActivityId,
    ) -> WorkflowResult<()> {
        Ok(())
    }
}

/// Behaviour for an activity kind
pub fn behavior_for(kind: &ActivityKind) -> &'static dyn ActivityBehavior {
    match kind {
        ActivityKind::Sequence
        | ActivityKind::EventDriven
        | ActivityKind::StateInitialization
        | ActivityKind::StateFinalization => &SequenceActivity,
        ActivityKind::Parallel => &ParallelActivity,
        ActivityKind::Listen => &ListenActivity,
        ActivityKind::EventHandlingScope => &EventHandlingScopeActivity,
        ActivityKind::EventHandlers => &EventHandlersActivity,
        ActivityKind::ConditionedActivityGroup { .. } => &ConditionedActivityGroup,
        ActivityKind::Replicator { .. } => &ReplicatorActivity,
        ActivityKind::StateMachine { .. } | ActivityKind::State => &StateActivity,
        ActivityKind::SetState { .. } => &SetStateActivity,
        ActivityKind::WaitForEvent { .. } => &WaitForEventActivity,
        ActivityKind::Code { .. } => &CodeActivity,
    }
}

/// True when every enabled child is `Initialized` or `Closed`
pub(crate) fn all_children_quiescent(
    ctx: &dyn ActivityExecutionContext,
    activity: ActivityId,
) -> WorkflowResult<bool> {
    for child in ctx.enabled_children(activity) {
        if ctx.status(child)?.is_running() {
            return Ok(false);
        }
    }
    Ok(true)
}
