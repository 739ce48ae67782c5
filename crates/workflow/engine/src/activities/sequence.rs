//! Sequence: runs enabled children strictly in order
//!
//! EventDriven, StateInitialization and StateFinalization share this
//! behaviour.

use super::{node_state_accessor, ActivityBehavior};
use crate::context::{ActivityExecutionContext, RemovedActivity};
use crate::trace::TraceEvent;
use flowstate_types::*;

/// Runtime state of a sequence
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceState {
    /// Child currently scheduled. Tracked by name because dynamic updates
    /// may insert or remove siblings while it runs.
    pub active_child: Option<QualifiedName>,
    /// The active child was removed by a pending dynamic update
    pub active_child_removed: bool,
}

node_state_accessor!(sequence_state, Sequence, SequenceState);

#[derive(Clone, Copy, Debug, Default)]
pub struct SequenceActivity;

impl SequenceActivity {
    /// Schedule the child after the last closed one. Returns false when
    /// there is nothing left to run.
    fn try_schedule_next_child(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<bool> {
        let children = ctx.enabled_children(activity);
        if children.is_empty() {
            return Ok(false);
        }

        let mut next = 0;
        for (index, child) in children.iter().enumerate().rev() {
            if ctx.status(*child)? == ExecutionStatus::Closed {
                if index == children.len() - 1 {
                    return Ok(false);
                }
                next = index + 1;
                break;
            }
        }

        let child = children[next];
        let name = ctx.name_of(child)?;
        ctx.register_for_closed(child, activity);
        ctx.execute_activity(child)?;
        let sequence = ctx.name_of(activity)?;
        tracing::debug!(sequence = %sequence, child = %name, "Sequence child scheduled");
        sequence_state(ctx, activity)?.active_child = Some(name);
        Ok(true)
    }

    fn on_sequence_complete(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<()> {
        let name = ctx.name_of(activity)?;
        ctx.trace_mut()
            .record(TraceEvent::SequenceCompleted { activity: name });
        Ok(())
    }

    fn finish(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
        if ctx.status(activity)? == ExecutionStatus::Executing {
            Self::on_sequence_complete(ctx, activity)?;
        }
        sequence_state(ctx, activity)?.active_child = None;
        ctx.close_activity(activity)
    }
}

impl ActivityBehavior for SequenceActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        if Self::try_schedule_next_child(ctx, activity)? {
            return Ok(ExecutionStatus::Executing);
        }
        Self::on_sequence_complete(ctx, activity)?;
        Ok(ExecutionStatus::Closed)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        for child in ctx.enabled_children(activity).into_iter().rev() {
            match ctx.status(child)? {
                ExecutionStatus::Executing => {
                    ctx.cancel_activity(child)?;
                    return ctx.status(activity);
                }
                ExecutionStatus::Canceling | ExecutionStatus::Faulting => {
                    return ctx.status(activity);
                }
                ExecutionStatus::Closed => {
                    sequence_state(ctx, activity)?.active_child = None;
                    return Ok(ExecutionStatus::Closed);
                }
                ExecutionStatus::Initialized => {}
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
        let status = ctx.status(activity)?;
        if status.is_winding_down()
            || (status == ExecutionStatus::Executing
                && !Self::try_schedule_next_child(ctx, activity)?)
        {
            Self::finish(ctx, activity)?;
        }
        Ok(())
    }

    fn on_activity_removed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        removed: &RemovedActivity,
    ) -> WorkflowResult<()> {
        let state = sequence_state(ctx, activity)?;
        if removed.was_running && state.active_child.as_ref() == Some(&removed.name) {
            state.active_child_removed = true;
        }
        Ok(())
    }

    fn on_changes_completed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<()> {
        let state = sequence_state(ctx, activity)?;
        if !state.active_child_removed {
            return Ok(());
        }
        state.active_child_removed = false;
        state.active_child = None;

        let status = ctx.status(activity)?;
        if status.is_winding_down()
            || (status == ExecutionStatus::Executing
                && !Self::try_schedule_next_child(ctx, activity)?)
        {
            Self::finish(ctx, activity)?;
        }
        Ok(())
    }
}
