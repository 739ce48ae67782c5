//! Per-machine execution state and transition planning

use super::helpers::{child_states, contains_state, find_static_state, is_leaf_state, parent_state};
use super::subscriptions::StateMachineSubscriptionManager;
use crate::activities::node_state_accessor;
use crate::context::ActivityExecutionContext;
use crate::tree::ActivityTree;
use flowstate_types::*;
use std::collections::VecDeque;

/// A deferred operation, run against the live clone of the state it names
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateMachineAction {
    CloseState {
        state: QualifiedName,
    },
    ExecuteChildState {
        state: QualifiedName,
        child: QualifiedName,
    },
    Subscribe {
        state: QualifiedName,
        event_driven: QualifiedName,
    },
    Unsubscribe {
        state: QualifiedName,
        event_driven: QualifiedName,
    },
    ExternalEvent {
        state: QualifiedName,
        event_driven: QualifiedName,
    },
    SetState {
        state: QualifiedName,
        target: QualifiedName,
    },
    DisableQueues {
        state: QualifiedName,
    },
    EnteringState {
        state: QualifiedName,
    },
}

impl StateMachineAction {
    /// The state whose context runs this action
    pub fn state_name(&self) -> &QualifiedName {
        match self {
            Self::CloseState { state }
            | Self::ExecuteChildState { state, .. }
            | Self::Subscribe { state, .. }
            | Self::Unsubscribe { state, .. }
            | Self::ExternalEvent { state, .. }
            | Self::SetState { state, .. }
            | Self::DisableQueues { state }
            | Self::EnteringState { state } => state,
        }
    }
}

/// Runtime state of one state machine, held on its root
#[derive(Clone, Debug, Default)]
pub struct StateMachineExecutionState {
    /// Active leaf state
    pub current_state_name: Option<QualifiedName>,
    pub previous_state_name: Option<QualifiedName>,
    /// Pending transition target
    pub next_state_name: Option<QualifiedName>,
    pub completed: bool,
    /// A child activity has been scheduled and has not reported back yet
    pub scheduler_busy: bool,
    pub actions: VecDeque<StateMachineAction>,
    pub subscription_manager: StateMachineSubscriptionManager,
}

impl StateMachineExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_action(&mut self, action: StateMachineAction) {
        tracing::trace!(action = ?action, "State machine action queued");
        self.actions.push_back(action);
    }

    /// Queue the actions that leave `current` and enter `target`.
    ///
    /// States are closed bottom-up until one contains the target (a state
    /// never contains itself for this purpose, so a self-transition leaves
    /// and re-enters), then the chain of child states down to the target is
    /// executed.
    pub fn calculate_state_transition(
        &mut self,
        tree: &ActivityTree,
        root: ActivityId,
        current: ActivityId,
        target: &QualifiedName,
    ) -> WorkflowResult<()> {
        let target_id = find_static_state(tree, root, target)?;
        if !is_leaf_state(tree, target_id) {
            return Err(WorkflowError::InvalidTargetState(target.clone()));
        }

        let mut cursor = Some(current);
        while let Some(state) = cursor {
            let name = tree.name(state)?;
            if name != target && contains_state(tree, state, target) {
                break;
            }
            self.enqueue_action(StateMachineAction::CloseState { state: name.clone() });
            cursor = parent_state(tree, state);
        }
        let Some(mut state) = cursor else {
            return Err(WorkflowError::InvalidTargetState(target.clone()));
        };

        while tree.name(state)? != target {
            let next = child_states(tree, state)
                .into_iter()
                .find(|c| contains_state(tree, *c, target))
                .ok_or_else(|| WorkflowError::InvalidTargetState(target.clone()))?;
            self.enqueue_action(StateMachineAction::ExecuteChildState {
                state: tree.name(state)?.clone(),
                child: tree.name(next)?.clone(),
            });
            state = next;
        }
        Ok(())
    }
}

node_state_accessor!(execution_state_slot, StateMachine, Box<StateMachineExecutionState>);

/// The execution state stored on a state machine root
pub fn execution_state(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
) -> WorkflowResult<&mut StateMachineExecutionState> {
    Ok(execution_state_slot(ctx, root)?.as_mut())
}

/// Plan a transition from the static state `from` and append it to the root's queue
pub(crate) fn plan_transition(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    from: ActivityId,
    target: &QualifiedName,
) -> WorkflowResult<()> {
    let mut planned = StateMachineExecutionState::default();
    planned.calculate_state_transition(ctx.tree(), root, from, target)?;
    execution_state(ctx, root)?.actions.extend(planned.actions);
    tracing::info!(to = %target, "State transition planned");
    Ok(())
}

/// Turn a pending `next_state_name` into transition actions
pub(crate) fn process_transition_request(ctx: &mut dyn ActivityExecutionContext, root: ActivityId) -> WorkflowResult<()> {
    let state = execution_state(ctx, root)?;
    let Some(target) = state.next_state_name.clone() else {
        return Ok(());
    };
    let Some(current) = state.current_state_name.clone() else {
        return Err(WorkflowError::InvalidOperation(
            "transition requested before any state was entered".to_string(),
        ));
    };
    let current = find_static_state(ctx.tree(), root, &current)?;
    plan_transition(ctx, root, current, &target)?;
    execution_state(ctx, root)?.next_state_name = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (ActivityTree, ActivityId) {
        let def = ActivityDefinition::state_machine("Machine", "Idle")
            .with_child(ActivityDefinition::state("Idle"))
            .with_child(
                ActivityDefinition::state("Working")
                    .with_child(ActivityDefinition::state("Busy"))
                    .with_child(
                        ActivityDefinition::state("Blocked")
                            .with_child(ActivityDefinition::state("Waiting")),
                    ),
            );
        ActivityTree::from_definition(&def)
    }

    fn close(name: &str) -> StateMachineAction {
        StateMachineAction::CloseState { state: name.into() }
    }

    fn enter(parent: &str, child: &str) -> StateMachineAction {
        StateMachineAction::ExecuteChildState {
            state: parent.into(),
            child: child.into(),
        }
    }

    #[test]
    fn test_initial_transition_walks_down_from_root() {
        let (tree, root) = machine();
        let mut state = StateMachineExecutionState::new();
        state
            .calculate_state_transition(&tree, root, root, &"Waiting".into())
            .unwrap();
        let actions: Vec<_> = state.actions.into_iter().collect();
        assert_eq!(
            actions,
            vec![
                enter("Machine", "Working"),
                enter("Working", "Blocked"),
                enter("Blocked", "Waiting"),
            ]
        );
    }

    #[test]
    fn test_transition_closes_up_to_common_ancestor() {
        let (tree, root) = machine();
        let waiting = tree.find_by_name(root, "Waiting").unwrap();
        let mut state = StateMachineExecutionState::new();
        state
            .calculate_state_transition(&tree, root, waiting, &"Busy".into())
            .unwrap();
        let actions: Vec<_> = state.actions.into_iter().collect();
        assert_eq!(
            actions,
            vec![close("Waiting"), close("Blocked"), enter("Working", "Busy")]
        );
    }

    #[test]
    fn test_self_transition_reenters() {
        let (tree, root) = machine();
        let idle = tree.find_by_name(root, "Idle").unwrap();
        let mut state = StateMachineExecutionState::new();
        state
            .calculate_state_transition(&tree, root, idle, &"Idle".into())
            .unwrap();
        let actions: Vec<_> = state.actions.into_iter().collect();
        assert_eq!(actions, vec![close("Idle"), enter("Machine", "Idle")]);
    }

    #[test]
    fn test_composite_target_rejected() {
        let (tree, root) = machine();
        let mut state = StateMachineExecutionState::new();
        let result = state.calculate_state_transition(&tree, root, root, &"Working".into());
        assert!(matches!(result, Err(WorkflowError::InvalidTargetState(_))));
        assert!(state.actions.is_empty());
    }

    #[test]
    fn test_action_state_name() {
        let action = StateMachineAction::SetState {
            state: "Idle".into(),
            target: "Busy".into(),
        };
        assert_eq!(action.state_name().as_str(), "Idle");
    }
}
