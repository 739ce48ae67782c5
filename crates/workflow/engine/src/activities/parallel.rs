//! Parallel: runs every enabled child at once
//!
//! Concurrency here is logical. All children are `Executing` in the status
//! model and are resumed one callback at a time.

use super::{all_children_quiescent, ActivityBehavior};
use crate::context::ActivityExecutionContext;
use flowstate_types::*;

#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelActivity;

impl ActivityBehavior for ParallelActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let children = ctx.enabled_children(activity);
        if children.is_empty() {
            return Ok(ExecutionStatus::Closed);
        }
        for child in children {
            ctx.register_for_closed(child, activity);
            ctx.execute_activity(child)?;
        }
        Ok(ExecutionStatus::Executing)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let mut can_close = true;
        for child in ctx.enabled_children(activity) {
            match ctx.status(child)? {
                ExecutionStatus::Executing => {
                    ctx.cancel_activity(child)?;
                    can_close = false;
                }
                ExecutionStatus::Canceling | ExecutionStatus::Faulting => can_close = false,
                _ => {}
            }
        }
        if can_close {
            Ok(ExecutionStatus::Closed)
        } else {
            ctx.status(activity)
        }
    }

    fn on_child_closed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        _child: ActivityId,
    ) -> WorkflowResult<()> {
        if all_children_quiescent(ctx, activity)? {
            ctx.close_activity(activity)?;
        }
        Ok(())
    }

    fn on_activity_added(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        added: ActivityId,
    ) -> WorkflowResult<()> {
        let enabled = ctx.tree().node(added)?.enabled;
        if ctx.status(activity)? == ExecutionStatus::Executing && enabled {
            ctx.register_for_closed(added, activity);
            ctx.execute_activity(added)?;
        }
        Ok(())
    }

    fn on_changes_completed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<()> {
        if ctx.status(activity)?.is_running() && all_children_quiescent(ctx, activity)? {
            ctx.close_activity(activity)?;
        }
        Ok(())
    }
}
