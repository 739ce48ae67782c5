//! Execution trace: an ordered journal of everything an instance did
//!
//! Each record carries a monotonically increasing sequence number, so tests
//! and hosts can assert ordering between status changes, subscriptions and
//! state transitions without relying on wall-clock time.

use chrono::{DateTime, Utc};
use flowstate_types::{ActivityId, ExecutionStatus, QualifiedName, QueueName, RunId};
use serde::{Deserialize, Serialize};

/// Journal of one workflow instance
#[derive(Clone, Debug)]
pub struct ExecutionTrace {
    records: Vec<TraceRecord>,
    next_sequence: u64,
    enabled: bool,
}

impl ExecutionTrace {
    pub fn new(enabled: bool) -> Self {
        Self {
            records: Vec::new(),
            next_sequence: 0,
            enabled,
        }
    }

    /// Append a record
    pub fn record(&mut self, event: TraceEvent) {
        tracing::trace!(sequence = self.next_sequence, event = %event, "Trace recorded");
        if !self.enabled {
            return;
        }
        self.records.push(TraceRecord {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            event,
        });
        self.next_sequence += 1;
    }

    pub fn record_status(&mut self, activity: &QualifiedName, id: ActivityId, status: ExecutionStatus) {
        self.record(TraceEvent::StatusChanged {
            activity: activity.clone(),
            id,
            status,
        });
    }

    pub fn record_state_entered(&mut self, state: &QualifiedName) {
        self.record(TraceEvent::StateEntered {
            state: state.clone(),
        });
    }

    pub fn record_variable(&mut self, name: &str, value: &str) {
        self.record(TraceEvent::VariableUpdated {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    // ── Query methods ────────────────────────────────────────────────

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records that involve the named activity
    pub fn records_for(&self, activity: &str) -> Vec<&TraceRecord> {
        self.records
            .iter()
            .filter(|r| r.event.involves(activity))
            .collect()
    }

    /// Status transitions of every node carrying this name, in order
    pub fn status_changes(&self, activity: &str) -> Vec<ExecutionStatus> {
        self.records
            .iter()
            .filter_map(|r| match &r.event {
                TraceEvent::StatusChanged {
                    activity: name,
                    status,
                    ..
                } if name.as_str() == activity => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Names of activities in the order they started executing
    pub fn execution_order(&self) -> Vec<QualifiedName> {
        self.records
            .iter()
            .filter_map(|r| match &r.event {
                TraceEvent::StatusChanged {
                    activity,
                    status: ExecutionStatus::Executing,
                    ..
                } => Some(activity.clone()),
                _ => None,
            })
            .collect()
    }

    /// Leaf states in the order they were entered
    pub fn entered_states(&self) -> Vec<QualifiedName> {
        self.records
            .iter()
            .filter_map(|r| match &r.event {
                TraceEvent::StateEntered { state } => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sequence number of the first record matching the predicate
    pub fn position(&self, predicate: impl Fn(&TraceEvent) -> bool) -> Option<u64> {
        self.records
            .iter()
            .find(|r| predicate(&r.event))
            .map(|r| r.sequence)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for ExecutionTrace {
    fn default() -> Self {
        Self::new(true)
    }
}

/// One journal entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: TraceEvent,
}

/// What happened
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TraceEvent {
    InstanceStarted,
    InstanceClosed {
        outcome: String,
    },
    StatusChanged {
        activity: QualifiedName,
        id: ActivityId,
        status: ExecutionStatus,
    },
    ContextCreated {
        owner: QualifiedName,
        activity: QualifiedName,
        id: ActivityId,
    },
    ContextCompleted {
        activity: QualifiedName,
        id: ActivityId,
    },
    ActivityAbandoned {
        activity: QualifiedName,
        id: ActivityId,
    },
    QueueCreated {
        queue: QueueName,
    },
    QueueDeleted {
        queue: QueueName,
    },
    QueueEnabledChanged {
        queue: QueueName,
        enabled: bool,
    },
    ItemEnqueued {
        queue: QueueName,
    },
    ItemDequeued {
        queue: QueueName,
        activity: QualifiedName,
    },
    ListenerRegistered {
        queue: QueueName,
        listener: QualifiedName,
    },
    ListenerUnregistered {
        queue: QueueName,
        listener: QualifiedName,
    },
    ListenTriggered {
        listen: QualifiedName,
        branch: QualifiedName,
    },
    SequenceCompleted {
        activity: QualifiedName,
    },
    StateEntered {
        state: QualifiedName,
    },
    TransitionScheduled {
        from: QualifiedName,
        to: QualifiedName,
    },
    StateSubscribed {
        state: QualifiedName,
        event_driven: QualifiedName,
        queue: QueueName,
    },
    StateUnsubscribed {
        state: QualifiedName,
        event_driven: QualifiedName,
        queue: QueueName,
    },
    ReplicatorChildInitialized {
        replicator: QualifiedName,
        run_id: RunId,
        data: serde_json::Value,
    },
    ReplicatorChildCompleted {
        replicator: QualifiedName,
        run_id: RunId,
        data: serde_json::Value,
    },
    VariableUpdated {
        name: String,
        value: String,
    },
    FaultRaised {
        activity: QualifiedName,
        message: String,
    },
}

impl TraceEvent {
    /// Check if this event involves the named activity or state
    pub fn involves(&self, name: &str) -> bool {
        match self {
            Self::StatusChanged { activity, .. }
            | Self::ContextCreated { activity, .. }
            | Self::ContextCompleted { activity, .. }
            | Self::ActivityAbandoned { activity, .. }
            | Self::ItemDequeued { activity, .. }
            | Self::SequenceCompleted { activity }
            | Self::FaultRaised { activity, .. } => activity.as_str() == name,
            Self::ListenerRegistered { listener, .. } | Self::ListenerUnregistered { listener, .. } => {
                listener.as_str() == name
            }
            Self::ListenTriggered { listen, branch } => {
                listen.as_str() == name || branch.as_str() == name
            }
            Self::StateEntered { state } => state.as_str() == name,
            Self::TransitionScheduled { from, to } => from.as_str() == name || to.as_str() == name,
            Self::StateSubscribed {
                state, event_driven, ..
            }
            | Self::StateUnsubscribed {
                state, event_driven, ..
            } => state.as_str() == name || event_driven.as_str() == name,
            Self::ReplicatorChildInitialized { replicator, .. }
            | Self::ReplicatorChildCompleted { replicator, .. } => replicator.as_str() == name,
            _ => false,
        }
    }
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstanceStarted => write!(f, "instance_started"),
            Self::InstanceClosed { outcome } => write!(f, "instance_closed:{}", outcome),
            Self::StatusChanged {
                activity, status, ..
            } => write!(f, "status:{}:{}", activity, status),
            Self::ContextCreated { activity, .. } => write!(f, "context_created:{}", activity),
            Self::ContextCompleted { activity, .. } => write!(f, "context_completed:{}", activity),
            Self::ActivityAbandoned { activity, .. } => write!(f, "abandoned:{}", activity),
            Self::QueueCreated { queue } => write!(f, "queue_created:{}", queue),
            Self::QueueDeleted { queue } => write!(f, "queue_deleted:{}", queue),
            Self::QueueEnabledChanged { queue, enabled } => {
                write!(f, "queue_enabled:{}:{}", queue, enabled)
            }
            Self::ItemEnqueued { queue } => write!(f, "enqueued:{}", queue),
            Self::ItemDequeued { queue, activity } => write!(f, "dequeued:{}:{}", queue, activity),
            Self::ListenerRegistered { queue, listener } => {
                write!(f, "listener_registered:{}:{}", queue, listener)
            }
            Self::ListenerUnregistered { queue, listener } => {
                write!(f, "listener_unregistered:{}:{}", queue, listener)
            }
            Self::ListenTriggered { listen, branch } => {
                write!(f, "listen_triggered:{}:{}", listen, branch)
            }
            Self::SequenceCompleted { activity } => write!(f, "sequence_completed:{}", activity),
            Self::StateEntered { state } => write!(f, "state_entered:{}", state),
            Self::TransitionScheduled { from, to } => write!(f, "transition:{}->{}", from, to),
            Self::StateSubscribed { state, queue, .. } => {
                write!(f, "subscribed:{}:{}", state, queue)
            }
            Self::StateUnsubscribed { state, queue, .. } => {
                write!(f, "unsubscribed:{}:{}", state, queue)
            }
            Self::ReplicatorChildInitialized { replicator, .. } => {
                write!(f, "replicator_child_initialized:{}", replicator)
            }
            Self::ReplicatorChildCompleted { replicator, .. } => {
                write!(f, "replicator_child_completed:{}", replicator)
            }
            Self::VariableUpdated { name, value } => write!(f, "variable:{}={}", name, value),
            Self::FaultRaised { activity, .. } => write!(f, "fault:{}", activity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_increase() {
        let mut trace = ExecutionTrace::new(true);
        trace.record(TraceEvent::InstanceStarted);
        trace.record_state_entered(&QualifiedName::new("Open"));
        trace.record_variable("count", "1");

        let sequences: Vec<u64> = trace.records().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_disabled_trace_keeps_nothing() {
        let mut trace = ExecutionTrace::new(false);
        trace.record(TraceEvent::InstanceStarted);
        assert!(trace.is_empty());
    }

    #[test]
    fn test_status_changes_by_name() {
        let mut trace = ExecutionTrace::default();
        let name = QualifiedName::new("a");
        trace.record_status(&name, ActivityId(1), ExecutionStatus::Executing);
        trace.record_status(&QualifiedName::new("b"), ActivityId(2), ExecutionStatus::Executing);
        trace.record_status(&name, ActivityId(1), ExecutionStatus::Closed);

        assert_eq!(
            trace.status_changes("a"),
            vec![ExecutionStatus::Executing, ExecutionStatus::Closed]
        );
        assert_eq!(trace.execution_order().len(), 2);
        assert_eq!(trace.records_for("b").len(), 1);
    }

    #[test]
    fn test_transition_involves_both_ends() {
        let event = TraceEvent::TransitionScheduled {
            from: QualifiedName::new("Open"),
            to: QualifiedName::new("Closed"),
        };
        assert!(event.involves("Open"));
        assert!(event.involves("Closed"));
        assert!(!event.involves("Other"));
    }

    #[test]
    fn test_position() {
        let mut trace = ExecutionTrace::default();
        trace.record(TraceEvent::InstanceStarted);
        trace.record_state_entered(&QualifiedName::new("Open"));
        let pos = trace.position(|e| matches!(e, TraceEvent::StateEntered { .. }));
        assert_eq!(pos, Some(1));
    }
}
