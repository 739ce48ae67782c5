//! The state activity
//!
//! One behaviour serves the machine root, composite states and leaf
//! states. Entering and leaving is driven by the action queue: a state's
//! own `execute` only clears the busy flag and resumes draining, except
//! for the root (which plans the initial transition) and leaf states
//! (which run initialization and install subscriptions).

use super::actions::process_actions;
use super::execution_state::{execution_state, plan_transition, process_transition_request, StateMachineAction};
use super::helpers::{
    completed_state_name, finalization_of, initialization_of, is_leaf_state, is_root_state, root_state_of,
};
use super::subscriptions::{
    create_set_state_queue, delete_set_state_queue, enqueue_event, reevaluate_subscriptions,
    subscribe_to_set_state, unsubscribe_event_driven, unsubscribe_from_set_state, unsubscribe_state,
};
use super::StateMachineExecutionState;
use crate::activities::ActivityBehavior;
use crate::context::{ActivityExecutionContext, RemovedActivity};
use flowstate_types::*;

#[derive(Clone, Copy, Debug, Default)]
pub struct StateActivity;

/// Run an initialization or finalization child directly, making the machine busy
fn execute_phase(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: ActivityId,
    phase: ActivityId,
) -> WorkflowResult<()> {
    execution_state(ctx, root)?.scheduler_busy = true;
    ctx.register_for_closed(phase, state);
    ctx.execute_activity(phase)
}

/// A leaf state is now current: subscribe, then either finish the machine,
/// chain into a transition requested during initialization, or settle and
/// wait for events.
fn entering_leaf_state(ctx: &mut dyn ActivityExecutionContext, state: ActivityId) -> WorkflowResult<()> {
    let root = root_state_of(ctx.tree(), state)?;
    let name = ctx.name_of(state)?;
    subscribe_to_set_state(ctx, root, &name)?;

    let completed_state = completed_state_name(ctx.tree(), root)?;
    if completed_state.as_ref() == Some(&name) {
        let execution = execution_state(ctx, root)?;
        execution.completed = true;
        execution.enqueue_action(StateMachineAction::EnteringState { state: name.clone() });
        process_actions(ctx, state)?;
        tracing::info!(state = %name, "Completed state reached");
        return leaving_state(ctx, state);
    }

    if execution_state(ctx, root)?.next_state_name.is_none() {
        reevaluate_subscriptions(ctx, root)?;
        execution_state(ctx, root)?.enqueue_action(StateMachineAction::EnteringState { state: name });
    } else {
        execution_state(ctx, root)?.enqueue_action(StateMachineAction::EnteringState { state: name });
        process_transition_request(ctx, root)?;
    }
    process_actions(ctx, state)
}

/// Run the leaf's finalization if it has one, otherwise close
pub(crate) fn leaving_state(ctx: &mut dyn ActivityExecutionContext, state: ActivityId) -> WorkflowResult<()> {
    if is_leaf_state(ctx.tree(), state) {
        if let Some(finalization) = finalization_of(ctx.tree(), state) {
            let root = root_state_of(ctx.tree(), state)?;
            return execute_phase(ctx, root, state, finalization);
        }
    }
    complete(ctx, state)
}

fn complete(ctx: &mut dyn ActivityExecutionContext, state: ActivityId) -> WorkflowResult<()> {
    let root = root_state_of(ctx.tree(), state)?;
    cleanup(ctx, state)?;
    let name = ctx.name_of(state)?;
    let leaf = is_leaf_state(ctx.tree(), state);
    let execution = execution_state(ctx, root)?;
    if leaf {
        execution.previous_state_name = Some(name.clone());
    }
    if state != root {
        execution.scheduler_busy = true;
    }
    tracing::debug!(state = %name, "Leaving state");
    ctx.close_activity(state)
}

/// Release subscriptions held by the state. Skipped while faulting.
fn cleanup(ctx: &mut dyn ActivityExecutionContext, state: ActivityId) -> WorkflowResult<()> {
    if ctx.status(state)? == ExecutionStatus::Faulting {
        return Ok(());
    }
    let root = root_state_of(ctx.tree(), state)?;
    let name = ctx.name_of(state)?;
    unsubscribe_state(ctx, root, &name)?;
    if state == root {
        delete_set_state_queue(ctx, root)
    } else if is_leaf_state(ctx.tree(), state) {
        unsubscribe_from_set_state(ctx, root)
    } else {
        Ok(())
    }
}

/// Both phases reject a transition back into the state running them
fn check_phase_transition(ctx: &mut dyn ActivityExecutionContext, root: ActivityId, state: ActivityId) -> WorkflowResult<()> {
    let name = ctx.name_of(state)?;
    if execution_state(ctx, root)?.next_state_name.as_ref() == Some(&name) {
        return Err(WorkflowError::InvalidOperation(format!(
            "state '{}' cannot transition to itself from its initialization or finalization",
            name
        )));
    }
    Ok(())
}

impl ActivityBehavior for StateActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let root = root_state_of(ctx.tree(), activity)?;

        if activity == root {
            let initial = match &ctx.tree().node(root)?.kind {
                ActivityKind::StateMachine { initial_state, .. } => initial_state.clone(),
                _ => return Err(WorkflowError::NotInStateMachine(ctx.name_of(root)?)),
            };
            *execution_state(ctx, root)? = StateMachineExecutionState::new();
            create_set_state_queue(ctx, root)?;
            let machine = ctx.name_of(root)?;
            tracing::info!(machine = %machine, initial = %initial, "State machine started");
            plan_transition(ctx, root, root, &initial)?;
            process_actions(ctx, root)?;
            return ctx.status(activity);
        }

        let name = ctx.name_of(activity)?;
        execution_state(ctx, root)?.scheduler_busy = false;
        if !is_leaf_state(ctx.tree(), activity) {
            process_actions(ctx, activity)?;
            return ctx.status(activity);
        }

        execution_state(ctx, root)?.current_state_name = Some(name);
        match initialization_of(ctx.tree(), activity) {
            Some(initialization) => execute_phase(ctx, root, activity, initialization)?,
            None => entering_leaf_state(ctx, activity)?,
        }
        ctx.status(activity)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        cleanup(ctx, activity)?;
        let mut can_close = true;
        let mut running = ctx.execution_contexts(activity);
        running.extend(ctx.enabled_children(activity));
        for child in running {
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
        child: ActivityId,
    ) -> WorkflowResult<()> {
        let root = root_state_of(ctx.tree(), activity)?;
        let child_kind = ctx.tree().node(child)?.kind.clone();
        let child_is_state = child_kind.is_state();
        execution_state(ctx, root)?.scheduler_busy = false;
        if ctx.execution_contexts(activity).contains(&child) {
            ctx.complete_execution_context(child)?;
        }

        let status = ctx.status(activity)?;
        if status.is_winding_down() {
            let idle = ctx.execution_contexts(activity).is_empty()
                && crate::activities::all_children_quiescent(ctx, activity)?;
            if idle {
                ctx.close_activity(activity)?;
            }
            return Ok(());
        }
        if status != ExecutionStatus::Executing {
            return Ok(());
        }

        match child_kind {
            ActivityKind::EventDriven => {
                if execution_state(ctx, root)?.next_state_name.is_none() {
                    reevaluate_subscriptions(ctx, root)?;
                } else {
                    process_transition_request(ctx, root)?;
                }
                process_actions(ctx, activity)
            }
            ActivityKind::StateInitialization => {
                check_phase_transition(ctx, root, activity)?;
                entering_leaf_state(ctx, activity)
            }
            ActivityKind::StateFinalization => {
                check_phase_transition(ctx, root, activity)?;
                complete(ctx, activity)
            }
            _ if child_is_state => {
                if execution_state(ctx, root)?.completed {
                    leaving_state(ctx, activity)
                } else {
                    process_actions(ctx, activity)
                }
            }
            _ => Ok(()),
        }
    }

    fn handle_fault(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        self.cancel(ctx, activity)
    }

    fn on_queue_item_available(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        queue: &QueueName,
    ) -> WorkflowResult<()> {
        if !is_root_state(ctx.tree(), activity) {
            return Ok(());
        }
        enqueue_event(ctx, activity, queue)
    }

    fn on_activity_added(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        added: ActivityId,
    ) -> WorkflowResult<()> {
        if !matches!(ctx.tree().node(added)?.kind, ActivityKind::EventDriven) {
            return Ok(());
        }
        let queue = ctx.event_queue_of(added)?;
        ctx.queuing_service_mut().ensure_queue(&queue);
        ctx.set_queue_enabled(&queue, false)?;

        let root = root_state_of(ctx.tree(), activity)?;
        if execution_state(ctx, root)?.current_state_name.is_none() {
            return Ok(());
        }
        reevaluate_subscriptions(ctx, root)?;
        process_actions(ctx, activity)
    }

    fn on_activity_removed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        removed: &RemovedActivity,
    ) -> WorkflowResult<()> {
        if removed.event_queue.is_none() {
            return Ok(());
        }
        let root = root_state_of(ctx.tree(), activity)?;
        let state = ctx.name_of(activity)?;
        unsubscribe_event_driven(ctx, root, &state, &removed.name)
    }
}
