//! Listen: the first branch whose event fires wins
//!
//! Every EventDriven branch is subscribed at entry without executing. The
//! first queue notification unsubscribes all competitors and then executes
//! only the winning branch.

use super::{node_state_accessor, ActivityBehavior};
use crate::context::{ActivityExecutionContext, RemovedActivity};
use crate::trace::TraceEvent;
use flowstate_types::*;

/// One subscribed branch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenSubscription {
    pub branch: ActivityId,
    pub branch_name: QualifiedName,
    pub queue: QueueName,
}

/// Runtime state of a listen
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenState {
    pub subscriptions: Vec<ListenSubscription>,
    pub triggered: bool,
}

node_state_accessor!(listen_state, Listen, ListenState);

#[derive(Clone, Copy, Debug, Default)]
pub struct ListenActivity;

impl ListenActivity {
    fn subscribe_branch(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        branch: ActivityId,
    ) -> WorkflowResult<()> {
        let branch_name = ctx.name_of(branch)?;
        let queue = ctx.subscribe_event(branch, activity)?;
        listen_state(ctx, activity)?
            .subscriptions
            .push(ListenSubscription {
                branch,
                branch_name,
                queue,
            });
        Ok(())
    }

    fn unsubscribe_all(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<()> {
        let subscriptions = std::mem::take(&mut listen_state(ctx, activity)?.subscriptions);
        for subscription in subscriptions {
            ctx.unregister_for_queue_item_available(&subscription.queue, activity);
        }
        Ok(())
    }
}

impl ActivityBehavior for ListenActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let branches = ctx.enabled_children(activity);
        if branches.is_empty() {
            return Ok(ExecutionStatus::Closed);
        }
        *listen_state(ctx, activity)? = ListenState::default();
        for branch in branches {
            Self::subscribe_branch(ctx, activity, branch)?;
        }
        Ok(ExecutionStatus::Executing)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        if !listen_state(ctx, activity)?.triggered {
            Self::unsubscribe_all(ctx, activity)?;
            return Ok(ExecutionStatus::Closed);
        }
        for branch in ctx.enabled_children(activity) {
            match ctx.status(branch)? {
                ExecutionStatus::Executing => {
                    ctx.cancel_activity(branch)?;
                    return ctx.status(activity);
                }
                ExecutionStatus::Canceling | ExecutionStatus::Faulting => {
                    return ctx.status(activity);
                }
                _ => {}
            }
        }
        Ok(ExecutionStatus::Closed)
    }

    fn on_child_closed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        _child: ActivityId,
    ) -> WorkflowResult<()> {
        ctx.close_activity(activity)
    }

    fn on_queue_item_available(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        queue: &QueueName,
    ) -> WorkflowResult<()> {
        let state = listen_state(ctx, activity)?;
        if state.triggered {
            return Ok(());
        }
        let Some(winner) = state
            .subscriptions
            .iter()
            .find(|s| &s.queue == queue)
            .cloned()
        else {
            return Ok(());
        };
        let still_present = ctx.enabled_children(activity).contains(&winner.branch);
        if !still_present || ctx.status(activity)? != ExecutionStatus::Executing {
            return Ok(());
        }

        Self::unsubscribe_all(ctx, activity)?;
        listen_state(ctx, activity)?.triggered = true;

        let listen = ctx.name_of(activity)?;
        tracing::debug!(listen = %listen, branch = %winner.branch_name, "Listen triggered");
        ctx.trace_mut().record(TraceEvent::ListenTriggered {
            listen,
            branch: winner.branch_name,
        });

        ctx.register_for_closed(winner.branch, activity);
        ctx.execute_activity(winner.branch)
    }

    fn on_activity_added(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        added: ActivityId,
    ) -> WorkflowResult<()> {
        let enabled = ctx.tree().node(added)?.enabled;
        if ctx.status(activity)? == ExecutionStatus::Executing
            && enabled
            && !listen_state(ctx, activity)?.triggered
        {
            Self::subscribe_branch(ctx, activity, added)?;
        }
        Ok(())
    }

    fn on_activity_removed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        removed: &RemovedActivity,
    ) -> WorkflowResult<()> {
        let state = listen_state(ctx, activity)?;
        let Some(position) = state
            .subscriptions
            .iter()
            .position(|s| s.branch_name == removed.name)
        else {
            return Ok(());
        };
        let subscription = state.subscriptions.remove(position);
        let shared = state
            .subscriptions
            .iter()
            .any(|s| s.queue == subscription.queue);
        if !shared {
            ctx.unregister_for_queue_item_available(&subscription.queue, activity);
        }
        Ok(())
    }
}
