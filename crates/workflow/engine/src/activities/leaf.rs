//! Leaf activities: code, event and set-state

use super::{node_state_accessor, ActivityBehavior};
use crate::context::ActivityExecutionContext;
use crate::state_machine::{execution_state, root_state_of};
use crate::trace::TraceEvent;
use flowstate_types::*;

// ── Code ─────────────────────────────────────────────────────────────

/// Applies variable updates, or raises its configured fault
#[derive(Clone, Copy, Debug, Default)]
pub struct CodeActivity;

impl ActivityBehavior for CodeActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let node = ctx.tree().node(activity)?;
        let ActivityKind::Code { updates, fault } = &node.kind else {
            return Err(WorkflowError::InvalidOperation(format!(
                "'{}' is not a code activity",
                node.name
            )));
        };
        if let Some(message) = fault {
            return Err(WorkflowError::ActivityFaulted {
                activity: node.name.clone(),
                message: message.clone(),
            });
        }

        for update in updates.clone() {
            let value = update.apply(ctx.variables().get(update.name()).map(String::as_str));
            ctx.set_variable(update.name(), value);
        }
        Ok(ExecutionStatus::Closed)
    }
}

// ── WaitForEvent ─────────────────────────────────────────────────────

/// Runtime state of an event activity
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventState {
    /// The payload consumed from the queue
    pub payload: Option<serde_json::Value>,
}

node_state_accessor!(event_state, Event, EventState);

/// Consumes one item from its queue, waiting until one is available
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitForEventActivity;

impl WaitForEventActivity {
    fn queue_of(ctx: &dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<QueueName> {
        match &ctx.tree().node(activity)?.kind {
            ActivityKind::WaitForEvent { queue } => Ok(queue.clone()),
            _ => Err(WorkflowError::InvalidOperation(format!(
                "'{}' is not an event activity",
                ctx.name_of(activity)?
            ))),
        }
    }

    /// Take an item if one is present
    fn try_consume(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        queue: &QueueName,
    ) -> WorkflowResult<bool> {
        match ctx.dequeue_item(queue, activity)? {
            Some(payload) => {
                event_state(ctx, activity)?.payload = Some(payload);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ActivityBehavior for WaitForEventActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let queue = Self::queue_of(ctx, activity)?;
        ctx.queuing_service_mut().ensure_queue(&queue);
        if Self::try_consume(ctx, activity, &queue)? {
            return Ok(ExecutionStatus::Closed);
        }
        ctx.register_for_queue_item_available(&queue, activity)?;
        Ok(ExecutionStatus::Executing)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let queue = Self::queue_of(ctx, activity)?;
        ctx.unregister_for_queue_item_available(&queue, activity);
        Ok(ExecutionStatus::Closed)
    }

    fn on_queue_item_available(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        queue: &QueueName,
    ) -> WorkflowResult<()> {
        if Self::try_consume(ctx, activity, queue)? {
            ctx.unregister_for_queue_item_available(queue, activity);
            ctx.close_activity(activity)?;
        }
        Ok(())
    }
}

// ── SetState ─────────────────────────────────────────────────────────

/// Records the transition target of the enclosing state machine
#[derive(Clone, Copy, Debug, Default)]
pub struct SetStateActivity;

impl ActivityBehavior for SetStateActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let target = match &ctx.tree().node(activity)?.kind {
            ActivityKind::SetState { target_state } => target_state.clone(),
            _ => {
                return Err(WorkflowError::InvalidOperation(format!(
                    "'{}' is not a set-state activity",
                    ctx.name_of(activity)?
                )))
            }
        };
        let root = root_state_of(ctx.tree(), activity)?;
        let state = execution_state(ctx, root)?;
        let from = state.current_state_name.clone().unwrap_or_else(|| QualifiedName::new(""));
        state.next_state_name = Some(target.clone());

        tracing::debug!(from = %from, to = %target, "State transition requested");
        ctx.trace_mut()
            .record(TraceEvent::TransitionScheduled { from, to: target });
        Ok(ExecutionStatus::Closed)
    }
}
