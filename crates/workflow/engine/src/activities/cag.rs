//! Conditioned activity group
//!
//! Children run whenever their `When` condition holds (default: exactly
//! once) until the group's `Until` condition becomes true. Every child run
//! happens in a fresh execution context so a child can run repeatedly.

use super::{node_state_accessor, ActivityBehavior};
use crate::context::{ActivityExecutionContext, RemovedActivity};
use flowstate_types::*;
use std::collections::BTreeMap;

/// Scheduling state of one child
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CagChildState {
    #[default]
    Idle,
    Pending,
    Executing,
}

/// Per-child bookkeeping
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CagChildStats {
    pub executed_count: u32,
    pub state: CagChildState,
}

/// Runtime state of a conditioned activity group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CagState {
    pub child_stats: BTreeMap<QualifiedName, CagChildStats>,
    pub completed: bool,
}

node_state_accessor!(cag_state, ConditionedGroup, CagState);

#[derive(Clone, Copy, Debug, Default)]
pub struct ConditionedActivityGroup;

impl ConditionedActivityGroup {
    fn until_condition(
        ctx: &dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<Option<ActivityCondition>> {
        match &ctx.tree().node(activity)?.kind {
            ActivityKind::ConditionedActivityGroup { until } => Ok(until.clone()),
            _ => Ok(None),
        }
    }

    /// Decide whether the group is done, marking runnable children pending.
    ///
    /// Fails with `CagQuiet` when an `Until` condition exists, is false, and
    /// no child has work left.
    pub fn evaluate_conditions(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<bool> {
        if cag_state(ctx, activity)?.completed {
            return Ok(false);
        }
        let until = Self::until_condition(ctx, activity)?;
        if let Some(condition) = &until {
            if ctx.evaluate(condition) {
                return Ok(true);
            }
        }

        let mut decisions = Vec::new();
        for child in ctx.enabled_children(activity) {
            let node = ctx.tree().node(child)?;
            decisions.push((node.name.clone(), node.when.clone()));
        }

        let mut outstanding = 0;
        for (name, when) in decisions {
            let stats = cag_state(ctx, activity)?
                .child_stats
                .entry(name.clone())
                .or_default()
                .clone();
            match stats.state {
                CagChildState::Executing | CagChildState::Pending => outstanding += 1,
                CagChildState::Idle => {
                    let runnable = match &when {
                        Some(condition) => ctx.evaluate(condition),
                        None => stats.executed_count == 0,
                    };
                    if runnable {
                        if let Some(entry) = cag_state(ctx, activity)?.child_stats.get_mut(&name) {
                            entry.state = CagChildState::Pending;
                        }
                        outstanding += 1;
                    }
                }
            }
        }

        if outstanding > 0 {
            return Ok(false);
        }
        if until.is_some() {
            return Err(WorkflowError::CagQuiet(ctx.name_of(activity)?));
        }
        Ok(true)
    }

    /// Start every pending child in its own context
    fn trigger_children(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
        if cag_state(ctx, activity)?.completed {
            return Ok(());
        }
        for child in ctx.enabled_children(activity) {
            let name = ctx.name_of(child)?;
            let pending = cag_state(ctx, activity)?
                .child_stats
                .get(&name)
                .map(|s| s.state == CagChildState::Pending)
                .unwrap_or(false);
            if !pending {
                continue;
            }
            let clone = ctx.create_execution_context(child)?;
            ctx.register_for_closed(clone, activity);
            ctx.execute_activity(clone)?;
            if let Some(stats) = cag_state(ctx, activity)?.child_stats.get_mut(&name) {
                stats.state = CagChildState::Executing;
            }
            tracing::debug!(child = %name, "Conditioned group child started");
        }
        Ok(())
    }

    /// Mark the group completed and cancel running children. Returns true
    /// if the group can close right away.
    fn cleanup(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<bool> {
        cag_state(ctx, activity)?.completed = true;
        let mut can_close = true;
        for clone in ctx.execution_contexts(activity) {
            can_close = false;
            if ctx.status(clone)? == ExecutionStatus::Executing {
                ctx.cancel_activity(clone)?;
            }
        }
        Ok(can_close)
    }

    /// Re-evaluate after any change and either finish or start pending children
    fn advance(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
        if cag_state(ctx, activity)?.completed {
            if ctx.execution_contexts(activity).is_empty() {
                ctx.close_activity(activity)?;
            }
            return Ok(());
        }
        if Self::evaluate_conditions(ctx, activity)? {
            if Self::cleanup(ctx, activity)? {
                ctx.close_activity(activity)?;
            }
        } else {
            Self::trigger_children(ctx, activity)?;
        }
        Ok(())
    }
}

impl ActivityBehavior for ConditionedActivityGroup {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let mut state = CagState::default();
        for child in ctx.enabled_children(activity) {
            state
                .child_stats
                .insert(ctx.name_of(child)?, CagChildStats::default());
        }
        *cag_state(ctx, activity)? = state;

        if Self::evaluate_conditions(ctx, activity)? {
            if Self::cleanup(ctx, activity)? {
                return Ok(ExecutionStatus::Closed);
            }
            return ctx.status(activity);
        }
        Self::trigger_children(ctx, activity)?;
        Ok(ExecutionStatus::Executing)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        if Self::cleanup(ctx, activity)? {
            Ok(ExecutionStatus::Closed)
        } else {
            ctx.status(activity)
        }
    }

    fn on_child_closed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        child: ActivityId,
    ) -> WorkflowResult<()> {
        let name = ctx.name_of(child)?;
        if let Some(stats) = cag_state(ctx, activity)?.child_stats.get_mut(&name) {
            stats.executed_count += 1;
            stats.state = CagChildState::Idle;
        }
        ctx.complete_execution_context(child)?;

        match ctx.status(activity)? {
            ExecutionStatus::Executing => Self::advance(ctx, activity),
            status if status.is_winding_down() => {
                if ctx.execution_contexts(activity).is_empty() {
                    ctx.close_activity(activity)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_activity_added(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        added: ActivityId,
    ) -> WorkflowResult<()> {
        let name = ctx.name_of(added)?;
        cag_state(ctx, activity)?
            .child_stats
            .entry(name)
            .or_default();
        Ok(())
    }

    fn on_activity_removed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        removed: &RemovedActivity,
    ) -> WorkflowResult<()> {
        cag_state(ctx, activity)?.child_stats.remove(&removed.name);
        Ok(())
    }

    fn on_changes_completed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<()> {
        if ctx.status(activity)? == ExecutionStatus::Executing {
            Self::advance(ctx, activity)?;
        }
        Ok(())
    }
}
