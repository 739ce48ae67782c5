//! Event handling scope and its handlers
//!
//! An EventHandlingScope runs a body next to an EventHandlers child. The
//! handlers stay subscribed for as long as the body runs; every event
//! occurrence runs its EventDriven handler in a fresh context, one at a time
//! per handler. When the body closes the handlers are told to stop
//! listening and close once their in-flight handlers finish.

use super::{all_children_quiescent, node_state_accessor, ActivityBehavior};
use crate::context::{ActivityExecutionContext, Callback, RemovedActivity};
use flowstate_types::*;

// ── Scope ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default)]
pub struct EventHandlingScopeActivity;

impl EventHandlingScopeActivity {
    /// (handlers, body) among the enabled children
    fn parts(
        ctx: &dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<(Option<ActivityId>, Option<ActivityId>)> {
        let mut handlers = None;
        let mut body = None;
        for child in ctx.enabled_children(activity) {
            if matches!(ctx.tree().node(child)?.kind, ActivityKind::EventHandlers) {
                handlers = Some(child);
            } else if body.is_none() {
                body = Some(child);
            }
        }
        Ok((handlers, body))
    }
}

impl ActivityBehavior for EventHandlingScopeActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let (handlers, body) = Self::parts(ctx, activity)?;
        if handlers.is_none() && body.is_none() {
            return Ok(ExecutionStatus::Closed);
        }
        for child in [handlers, body].into_iter().flatten() {
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
        child: ActivityId,
    ) -> WorkflowResult<()> {
        let status = ctx.status(activity)?;
        if status.is_winding_down() {
            if all_children_quiescent(ctx, activity)? {
                ctx.close_activity(activity)?;
            }
            return Ok(());
        }
        if status != ExecutionStatus::Executing {
            return Ok(());
        }

        let (handlers, body) = Self::parts(ctx, activity)?;
        if Some(child) == body {
            let handlers_status = match handlers {
                Some(h) => Some((h, ctx.status(h)?)),
                None => None,
            };
            match handlers_status {
                Some((h, ExecutionStatus::Executing)) => ctx.invoke(h, Callback::UnsubscribeAndClose),
                Some((_, status)) if status.is_running() => {}
                _ => ctx.close_activity(activity)?,
            }
        } else if Some(child) == handlers {
            let body_done = match body {
                Some(b) => ctx.status(b)?.is_quiescent(),
                None => true,
            };
            if body_done {
                ctx.close_activity(activity)?;
            }
        }
        Ok(())
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// One subscribed EventDriven handler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventHandlerSubscriber {
    pub event_driven: QualifiedName,
    /// Static handler every occurrence is cloned from
    pub template: ActivityId,
    pub queue: QueueName,
    /// Occurrences that arrived while a clone was still running
    pub pending_executions: u32,
}

/// Runtime state of an EventHandlers activity
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventHandlersState {
    pub subscribers: Vec<EventHandlerSubscriber>,
    /// The enclosing scope's body has closed
    pub scope_completed: bool,
}

node_state_accessor!(handlers_state, EventHandlers, EventHandlersState);

#[derive(Clone, Copy, Debug, Default)]
pub struct EventHandlersActivity;

impl EventHandlersActivity {
    fn subscribe(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        event_driven: ActivityId,
    ) -> WorkflowResult<()> {
        let name = ctx.name_of(event_driven)?;
        let queue = ctx.subscribe_event(event_driven, activity)?;
        handlers_state(ctx, activity)?
            .subscribers
            .push(EventHandlerSubscriber {
                event_driven: name,
                template: event_driven,
                queue,
                pending_executions: 0,
            });
        Ok(())
    }

    fn unsubscribe_all(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
        let queues: Vec<QueueName> = handlers_state(ctx, activity)?
            .subscribers
            .iter()
            .map(|s| s.queue.clone())
            .collect();
        for queue in queues {
            ctx.unregister_for_queue_item_available(&queue, activity);
        }
        Ok(())
    }

    /// Run one occurrence of a handler in a new context
    fn start_occurrence(
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        template: ActivityId,
    ) -> WorkflowResult<()> {
        let clone = ctx.create_execution_context(template)?;
        ctx.register_for_closed(clone, activity);
        ctx.execute_activity(clone)?;
        let handler = ctx.name_of(clone)?;
        tracing::debug!(handler = %handler, "Event handler occurrence started");
        Ok(())
    }
}

/// Stop listening and close once every in-flight handler has finished
pub fn unsubscribe_and_close(ctx: &mut dyn ActivityExecutionContext, activity: ActivityId) -> WorkflowResult<()> {
    handlers_state(ctx, activity)?.scope_completed = true;
    EventHandlersActivity::unsubscribe_all(ctx, activity)?;
    for subscriber in handlers_state(ctx, activity)?.subscribers.iter_mut() {
        subscriber.pending_executions = 0;
    }
    if ctx.execution_contexts(activity).is_empty() {
        ctx.close_activity(activity)?;
    }
    Ok(())
}

impl ActivityBehavior for EventHandlersActivity {
    fn execute(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        let handlers = ctx.enabled_children(activity);
        if handlers.is_empty() {
            return Ok(ExecutionStatus::Closed);
        }
        *handlers_state(ctx, activity)? = EventHandlersState::default();
        for handler in handlers {
            Self::subscribe(ctx, activity, handler)?;
        }
        Ok(ExecutionStatus::Executing)
    }

    fn cancel(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
    ) -> WorkflowResult<ExecutionStatus> {
        Self::unsubscribe_all(ctx, activity)?;
        let contexts = ctx.execution_contexts(activity);
        if contexts.is_empty() {
            return Ok(ExecutionStatus::Closed);
        }
        for clone in contexts {
            if ctx.status(clone)? == ExecutionStatus::Executing {
                ctx.cancel_activity(clone)?;
            }
        }
        ctx.status(activity)
    }

    fn on_queue_item_available(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        queue: &QueueName,
    ) -> WorkflowResult<()> {
        if handlers_state(ctx, activity)?.scope_completed {
            return Ok(());
        }
        let matching: Vec<(usize, QualifiedName, ActivityId)> = handlers_state(ctx, activity)?
            .subscribers
            .iter()
            .enumerate()
            .filter(|(_, s)| &s.queue == queue)
            .map(|(i, s)| (i, s.event_driven.clone(), s.template))
            .collect();

        for (index, name, template) in matching {
            if ctx.get_execution_context(activity, &name).is_some() {
                if let Some(subscriber) = handlers_state(ctx, activity)?.subscribers.get_mut(index) {
                    subscriber.pending_executions += 1;
                }
            } else {
                Self::start_occurrence(ctx, activity, template)?;
            }
        }
        Ok(())
    }

    fn on_child_closed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        child: ActivityId,
    ) -> WorkflowResult<()> {
        let name = ctx.name_of(child)?;
        ctx.complete_execution_context(child)?;

        let status = ctx.status(activity)?;
        if status.is_winding_down() {
            if ctx.execution_contexts(activity).is_empty() {
                ctx.close_activity(activity)?;
            }
            return Ok(());
        }

        let state = handlers_state(ctx, activity)?;
        let scope_completed = state.scope_completed;
        let next = state
            .subscribers
            .iter_mut()
            .find(|s| s.event_driven == name && s.pending_executions > 0)
            .map(|s| {
                s.pending_executions -= 1;
                s.template
            });

        match next {
            Some(template) if !scope_completed => Self::start_occurrence(ctx, activity, template),
            _ => {
                if scope_completed && ctx.execution_contexts(activity).is_empty() {
                    ctx.close_activity(activity)?;
                }
                Ok(())
            }
        }
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
            && !handlers_state(ctx, activity)?.scope_completed
        {
            Self::subscribe(ctx, activity, added)?;
        }
        Ok(())
    }

    fn on_activity_removed(
        &self,
        ctx: &mut dyn ActivityExecutionContext,
        activity: ActivityId,
        removed: &RemovedActivity,
    ) -> WorkflowResult<()> {
        let state = handlers_state(ctx, activity)?;
        let Some(position) = state
            .subscribers
            .iter()
            .position(|s| s.event_driven == removed.name)
        else {
            return Ok(());
        };
        let subscriber = state.subscribers.remove(position);
        let shared = state.subscribers.iter().any(|s| s.queue == subscriber.queue);
        if !shared {
            ctx.unregister_for_queue_item_available(&subscriber.queue, activity);
        }
        let idle = ctx.execution_contexts(activity).is_empty();
        if idle && handlers_state(ctx, activity)?.scope_completed {
            ctx.close_activity(activity)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_state_default() {
        let state = EventHandlersState::default();
        assert!(state.subscribers.is_empty());
        assert!(!state.scope_completed);
    }
}
