//! Activity execution status

use serde::{Deserialize, Serialize};

/// Lifecycle status of one activity.
///
/// `Canceling` and `Faulting` are transient: a composite in either status
/// must drive its outstanding children to `Closed` before it closes itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Initialized,
    Executing,
    Canceling,
    Faulting,
    Closed,
}

impl ExecutionStatus {
    /// Initialized or Closed: nothing is in flight
    pub fn is_quiescent(&self) -> bool {
        matches!(self, Self::Initialized | Self::Closed)
    }

    /// Executing, Canceling or Faulting
    pub fn is_running(&self) -> bool {
        !self.is_quiescent()
    }

    pub fn is_winding_down(&self) -> bool {
        matches!(self, Self::Canceling | Self::Faulting)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Initialized => "Initialized",
            Self::Executing => "Executing",
            Self::Canceling => "Canceling",
            Self::Faulting => "Faulting",
            Self::Closed => "Closed",
        };
        f.write_str(label)
    }
}

/// How a closed activity ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// Not closed yet
    None,
    Succeeded,
    Canceled,
    Faulted,
}

impl ExecutionResult {
    /// The result an activity closes with, given the status it closes from
    pub fn closing_from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Canceling => Self::Canceled,
            ExecutionStatus::Faulting => Self::Faulted,
            _ => Self::Succeeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiescence() {
        assert!(ExecutionStatus::Initialized.is_quiescent());
        assert!(ExecutionStatus::Closed.is_quiescent());
        assert!(ExecutionStatus::Executing.is_running());
        assert!(ExecutionStatus::Canceling.is_running());
        assert!(ExecutionStatus::Faulting.is_winding_down());
        assert!(!ExecutionStatus::Executing.is_winding_down());
    }

    #[test]
    fn test_closing_result() {
        assert_eq!(
            ExecutionResult::closing_from(ExecutionStatus::Executing),
            ExecutionResult::Succeeded
        );
        assert_eq!(
            ExecutionResult::closing_from(ExecutionStatus::Canceling),
            ExecutionResult::Canceled
        );
        assert_eq!(
            ExecutionResult::closing_from(ExecutionStatus::Faulting),
            ExecutionResult::Faulted
        );
    }
}
