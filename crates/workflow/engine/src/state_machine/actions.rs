//! Action queue interpreter
//!
//! Actions run strictly in order, one at a time. Draining stops as soon as
//! an action schedules child work (the machine becomes busy); the closure
//! of that child resumes draining. An action naming a state other than the
//! one currently draining is handed over to that state's live clone through
//! a `ProcessStateActions` callback.

use super::execution_state::{execution_state, plan_transition, StateMachineAction};
use super::helpers::{find_dynamic_state, find_static_state, root_state_of};
use super::state::leaving_state;
use super::subscriptions::{disable_queues, process_queue, subscribe_event_driven, unsubscribe_event_driven};
use crate::context::{ActivityExecutionContext, Callback};
use flowstate_types::*;

/// Drain the action queue from the live state `state`
pub(crate) fn process_actions(ctx: &mut dyn ActivityExecutionContext, state: ActivityId) -> WorkflowResult<()> {
    let root = root_state_of(ctx.tree(), state)?;
    let state_name = ctx.name_of(state)?;
    loop {
        let execution = execution_state(ctx, root)?;
        if execution.scheduler_busy {
            return Ok(());
        }
        let Some(action) = execution.actions.front().cloned() else {
            return process_queue(ctx, root, state);
        };

        if *action.state_name() != state_name {
            let owner = action.state_name().clone();
            let Some(target) = find_dynamic_state(ctx, root, &owner)? else {
                return Err(WorkflowError::StateNotFound(owner));
            };
            execution_state(ctx, root)?.scheduler_busy = true;
            tracing::trace!(from = %state_name, to = %owner, "Handing action queue over");
            ctx.invoke(target, Callback::ProcessStateActions);
            return Ok(());
        }

        execution_state(ctx, root)?.actions.pop_front();
        execute_action(ctx, root, state, action)?;
    }
}

/// Callback entry point: the machine is idle again in `state`
pub(crate) fn resume_actions(ctx: &mut dyn ActivityExecutionContext, state: ActivityId) -> WorkflowResult<()> {
    let root = root_state_of(ctx.tree(), state)?;
    execution_state(ctx, root)?.scheduler_busy = false;
    process_actions(ctx, state)
}

fn child_named(
    ctx: &dyn ActivityExecutionContext,
    state: ActivityId,
    name: &QualifiedName,
) -> WorkflowResult<ActivityId> {
    ctx.tree()
        .child_by_name(state, name)
        .ok_or_else(|| WorkflowError::ActivityNotFound(name.to_string()))
}

/// Run a child of `state` in a new context, making the machine busy
fn schedule_child(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: ActivityId,
    template: ActivityId,
) -> WorkflowResult<()> {
    execution_state(ctx, root)?.scheduler_busy = true;
    let clone = ctx.create_execution_context(template)?;
    ctx.register_for_closed(clone, state);
    ctx.execute_activity(clone)
}

fn execute_action(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: ActivityId,
    action: StateMachineAction,
) -> WorkflowResult<()> {
    match action {
        StateMachineAction::CloseState { .. } => leaving_state(ctx, state),
        StateMachineAction::ExecuteChildState { child, .. } => {
            let template = ctx
                .tree()
                .child_by_name(state, &child)
                .ok_or_else(|| WorkflowError::StateNotFound(child.clone()))?;
            tracing::debug!(state = %child, "Executing child state");
            schedule_child(ctx, root, state, template)
        }
        StateMachineAction::Subscribe { event_driven, .. } => {
            let event_driven = child_named(ctx, state, &event_driven)?;
            subscribe_event_driven(ctx, root, state, event_driven)
        }
        StateMachineAction::Unsubscribe {
            state: owner,
            event_driven,
        } => unsubscribe_event_driven(ctx, root, &owner, &event_driven),
        StateMachineAction::ExternalEvent { event_driven, .. } => {
            let template = child_named(ctx, state, &event_driven)?;
            tracing::debug!(event_driven = %event_driven, "Running event handler");
            schedule_child(ctx, root, state, template)
        }
        StateMachineAction::SetState { target, .. } => {
            let current = execution_state(ctx, root)?.current_state_name.clone();
            let from = match current {
                Some(name) => find_static_state(ctx.tree(), root, &name)?,
                None => root,
            };
            plan_transition(ctx, root, from, &target)
        }
        StateMachineAction::DisableQueues { .. } => disable_queues(ctx, root),
        StateMachineAction::EnteringState { state: entered } => {
            tracing::info!(state = %entered, "State entered");
            ctx.trace_mut().record_state_entered(&entered);
            Ok(())
        }
    }
}
