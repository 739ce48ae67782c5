//! State machine subscription bookkeeping
//!
//! The root state is the single queue listener for every event a state
//! subscribes to, plus the host-facing set-state queue. Notifications are
//! parked as pending events and turned into actions one at a time, only
//! while the machine is idle. A pending entry carries a copy of the
//! subscription it was raised for; entries whose subscription has since
//! been replaced, or whose queue has run dry, are dropped.

use super::actions::process_actions;
use super::execution_state::{execution_state, StateMachineAction};
use super::helpers::{child_states, event_driven_children, find_dynamic_state, parent_state};
use crate::context::ActivityExecutionContext;
use crate::trace::TraceEvent;
use flowstate_types::*;
use std::collections::{BTreeMap, VecDeque};

/// A state listening to the event of one of its EventDriven children
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventActivitySubscription {
    pub subscription_id: SubscriptionId,
    pub queue: QueueName,
    pub state_name: QualifiedName,
    pub event_driven_name: QualifiedName,
}

/// The active leaf state listening to the set-state queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetStateSubscription {
    pub subscription_id: SubscriptionId,
    pub state_name: QualifiedName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateMachineSubscription {
    Event(EventActivitySubscription),
    SetState(SetStateSubscription),
}

/// Live subscriptions keyed by queue, and events waiting to be processed
#[derive(Clone, Debug, Default)]
pub struct StateMachineSubscriptionManager {
    pub subscriptions: BTreeMap<QueueName, EventActivitySubscription>,
    pub set_state_subscription: Option<SetStateSubscription>,
    pub pending_events: VecDeque<StateMachineSubscription>,
}

impl StateMachineSubscriptionManager {
    pub fn is_subscribed(&self, queue: &QueueName) -> bool {
        self.subscriptions.contains_key(queue)
    }

    /// Queue of the subscription `state` holds for `event_driven`
    pub fn queue_of(&self, state: &QualifiedName, event_driven: &QualifiedName) -> Option<QueueName> {
        self.subscriptions
            .values()
            .find(|s| &s.state_name == state && &s.event_driven_name == event_driven)
            .map(|s| s.queue.clone())
    }

    /// EventDriven names `state` currently holds subscriptions for
    pub fn held_by(&self, state: &QualifiedName) -> Vec<QualifiedName> {
        self.subscriptions
            .values()
            .filter(|s| &s.state_name == state)
            .map(|s| s.event_driven_name.clone())
            .collect()
    }
}

fn set_state_queue(ctx: &dyn ActivityExecutionContext) -> QueueName {
    QueueName::new(ctx.config().set_state_queue_name.clone())
}

fn manager(ctx: &mut dyn ActivityExecutionContext, root: ActivityId) -> WorkflowResult<&mut StateMachineSubscriptionManager> {
    Ok(&mut execution_state(ctx, root)?.subscription_manager)
}

fn held_items(ctx: &dyn ActivityExecutionContext, queue: &QueueName) -> usize {
    ctx.queuing_service()
        .get_queue(queue)
        .map(|q| q.count())
        .unwrap_or(0)
}

// ── Event subscriptions ──────────────────────────────────────────────

/// Subscribe the live `state` to the event of its live `event_driven` child
pub(crate) fn subscribe_event_driven(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: ActivityId,
    event_driven: ActivityId,
) -> WorkflowResult<()> {
    let state_name = ctx.name_of(state)?;
    let event_driven_name = ctx.name_of(event_driven)?;
    let queue = ctx.event_queue_of(event_driven)?;
    ctx.queuing_service_mut().ensure_queue(&queue);

    let manager = manager(ctx, root)?;
    if manager.is_subscribed(&queue) {
        return Err(WorkflowError::StateAlreadySubscribesToThisEvent {
            state: state_name,
            queue,
        });
    }
    manager.subscriptions.insert(
        queue.clone(),
        EventActivitySubscription {
            subscription_id: SubscriptionId::generate(),
            queue: queue.clone(),
            state_name: state_name.clone(),
            event_driven_name: event_driven_name.clone(),
        },
    );

    tracing::debug!(state = %state_name, queue = %queue, "State subscribed");
    ctx.trace_mut().record(TraceEvent::StateSubscribed {
        state: state_name,
        event_driven: event_driven_name,
        queue: queue.clone(),
    });
    ctx.register_for_queue_item_available(&queue, root)
}

/// Drop the subscription `state` holds for `event_driven`, if any
pub(crate) fn unsubscribe_event_driven(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: &QualifiedName,
    event_driven: &QualifiedName,
) -> WorkflowResult<()> {
    let manager = manager(ctx, root)?;
    let Some(queue) = manager.queue_of(state, event_driven) else {
        return Ok(());
    };
    manager.subscriptions.remove(&queue);
    ctx.unregister_for_queue_item_available(&queue, root);

    tracing::debug!(state = %state, queue = %queue, "State unsubscribed");
    ctx.trace_mut().record(TraceEvent::StateUnsubscribed {
        state: state.clone(),
        event_driven: event_driven.clone(),
        queue,
    });
    Ok(())
}

/// Drop every subscription a state holds
pub(crate) fn unsubscribe_state(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: &QualifiedName,
) -> WorkflowResult<()> {
    for event_driven in manager(ctx, root)?.held_by(state) {
        unsubscribe_event_driven(ctx, root, state, &event_driven)?;
    }
    Ok(())
}

// ── Set-state queue ──────────────────────────────────────────────────

pub(crate) fn create_set_state_queue(ctx: &mut dyn ActivityExecutionContext, root: ActivityId) -> WorkflowResult<()> {
    let queue = set_state_queue(ctx);
    ctx.queuing_service_mut().ensure_queue(&queue);
    ctx.register_for_queue_item_available(&queue, root)
}

pub(crate) fn delete_set_state_queue(ctx: &mut dyn ActivityExecutionContext, root: ActivityId) -> WorkflowResult<()> {
    let queue = set_state_queue(ctx);
    ctx.unregister_for_queue_item_available(&queue, root);
    if ctx.queuing_service().exists(&queue) {
        ctx.queuing_service_mut().delete_queue(&queue)?;
        ctx.trace_mut().record(TraceEvent::QueueDeleted { queue });
    }
    Ok(())
}

/// Let the active leaf receive set-state requests, including ones already waiting
pub(crate) fn subscribe_to_set_state(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: &QualifiedName,
) -> WorkflowResult<()> {
    let queue = set_state_queue(ctx);
    let held = held_items(ctx, &queue);
    let subscription = SetStateSubscription {
        subscription_id: SubscriptionId::generate(),
        state_name: state.clone(),
    };
    let manager = manager(ctx, root)?;
    manager.set_state_subscription = Some(subscription.clone());
    for _ in 0..held {
        manager
            .pending_events
            .push_back(StateMachineSubscription::SetState(subscription.clone()));
    }
    Ok(())
}

pub(crate) fn unsubscribe_from_set_state(ctx: &mut dyn ActivityExecutionContext, root: ActivityId) -> WorkflowResult<()> {
    manager(ctx, root)?.set_state_subscription = None;
    Ok(())
}

// ── Event delivery ───────────────────────────────────────────────────

/// Park a queue notification delivered to the root, then try to process it
pub(crate) fn enqueue_event(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    queue: &QueueName,
) -> WorkflowResult<()> {
    let is_set_state = *queue == set_state_queue(ctx);
    let manager = manager(ctx, root)?;
    let pending = if is_set_state {
        manager
            .set_state_subscription
            .clone()
            .map(StateMachineSubscription::SetState)
    } else {
        manager
            .subscriptions
            .get(queue)
            .cloned()
            .map(StateMachineSubscription::Event)
    };
    if let Some(pending) = pending {
        manager.pending_events.push_back(pending);
    }
    process_queue(ctx, root, root)
}

/// Turn the next deliverable pending event into an action, if the machine is idle
pub(crate) fn process_queue(
    ctx: &mut dyn ActivityExecutionContext,
    root: ActivityId,
    state: ActivityId,
) -> WorkflowResult<()> {
    loop {
        let execution = execution_state(ctx, root)?;
        let Some(current) = execution.current_state_name.clone() else {
            return Ok(());
        };
        if !execution.actions.is_empty() || execution.scheduler_busy || execution.completed {
            return Ok(());
        }
        let manager = &mut execution.subscription_manager;
        let Some(pending) = manager.pending_events.pop_front() else {
            return Ok(());
        };

        let action = match pending {
            StateMachineSubscription::Event(subscription) => {
                let live = manager
                    .subscriptions
                    .get(&subscription.queue)
                    .map(|s| s.subscription_id == subscription.subscription_id)
                    .unwrap_or(false);
                if !live || held_items(ctx, &subscription.queue) == 0 {
                    continue;
                }
                StateMachineAction::ExternalEvent {
                    state: subscription.state_name,
                    event_driven: subscription.event_driven_name,
                }
            }
            StateMachineSubscription::SetState(subscription) => {
                let live = manager
                    .set_state_subscription
                    .as_ref()
                    .map(|s| s.subscription_id == subscription.subscription_id)
                    .unwrap_or(false);
                if !live {
                    continue;
                }
                let queue = set_state_queue(ctx);
                let Some(payload) = ctx.dequeue_item(&queue, root)? else {
                    continue;
                };
                let args = SetStateEventArgs::from_payload(payload)?;
                tracing::info!(target_state = %args.target_state_name, "Set-state request received");
                StateMachineAction::SetState {
                    state: current,
                    target: args.target_state_name,
                }
            }
        };
        execution_state(ctx, root)?.enqueue_action(action);
        return process_actions(ctx, state);
    }
}

// ── Re-evaluation ────────────────────────────────────────────────────

/// True if a state named `candidate` is a strict ancestor of `state`
fn is_parent_state(ctx: &dyn ActivityExecutionContext, state: ActivityId, candidate: &QualifiedName) -> bool {
    let tree = ctx.tree();
    let mut cursor = parent_state(tree, state);
    while let Some(parent) = cursor {
        if tree.name(parent).map(|n| n == candidate).unwrap_or(false) {
            return true;
        }
        cursor = parent_state(tree, parent);
    }
    false
}

/// Queue subscribe/unsubscribe actions so the active leaf and its ancestors
/// listen to their events, closer states shadowing farther ones, then queue
/// a queue-disabling pass.
pub(crate) fn reevaluate_subscriptions(ctx: &mut dyn ActivityExecutionContext, root: ActivityId) -> WorkflowResult<()> {
    let execution = execution_state(ctx, root)?;
    let Some(current_name) = execution.current_state_name.clone() else {
        return Ok(());
    };
    let mut snapshot = execution.subscription_manager.subscriptions.clone();
    let current = find_dynamic_state(ctx, root, &current_name)?
        .ok_or_else(|| WorkflowError::StateNotFound(current_name.clone()))?;

    let mut planned = Vec::new();
    let mut subscribed: Vec<QueueName> = Vec::new();
    let mut cursor = Some(current);
    while let Some(state) = cursor {
        let state_name = ctx.name_of(state)?;
        for event_driven in event_driven_children(ctx.tree(), state) {
            let event_driven_name = ctx.name_of(event_driven)?;
            let queue = ctx.event_queue_of(event_driven)?;

            if let Some(existing) = snapshot.get(&queue).cloned() {
                if existing.event_driven_name == event_driven_name {
                    subscribed.push(queue);
                    continue;
                }
                if existing.state_name == state_name {
                    return Err(WorkflowError::StateAlreadySubscribesToThisEvent {
                        state: state_name,
                        queue,
                    });
                }
                if is_parent_state(ctx, state, &existing.state_name) {
                    planned.push(StateMachineAction::Unsubscribe {
                        state: existing.state_name,
                        event_driven: existing.event_driven_name,
                    });
                    snapshot.remove(&queue);
                }
            }
            if subscribed.contains(&queue) {
                continue;
            }
            planned.push(StateMachineAction::Subscribe {
                state: state_name.clone(),
                event_driven: event_driven_name,
            });
            subscribed.push(queue);
        }
        cursor = parent_state(ctx.tree(), state);
    }
    planned.push(StateMachineAction::DisableQueues { state: current_name });

    let execution = execution_state(ctx, root)?;
    for action in planned {
        execution.enqueue_action(action);
    }
    Ok(())
}

/// Enable exactly the state event queues that are currently subscribed.
///
/// Running states are inspected through their live clones so EventDriven
/// branches added to a running state are covered too.
pub(crate) fn disable_queues(ctx: &mut dyn ActivityExecutionContext, root: ActivityId) -> WorkflowResult<()> {
    let mut queues = Vec::new();
    let mut frontier = VecDeque::from([root]);
    while let Some(state) = frontier.pop_front() {
        for event_driven in event_driven_children(ctx.tree(), state) {
            queues.push(ctx.event_queue_of(event_driven)?);
        }
        for child in child_states(ctx.tree(), state) {
            let name = ctx.name_of(child)?;
            frontier.push_back(ctx.get_execution_context(state, &name).unwrap_or(child));
        }
    }

    for queue in queues {
        let enabled = manager(ctx, root)?.is_subscribed(&queue);
        ctx.queuing_service_mut().ensure_queue(&queue);
        ctx.set_queue_enabled(&queue, enabled)?;
    }
    Ok(())
}
