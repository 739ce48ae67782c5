//! Payloads the host posts to workflow queues

use crate::QualifiedName;
use serde::{Deserialize, Serialize};

/// Payload of the state machine's set-state queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStateEventArgs {
    /// Leaf state the machine should transition to
    pub target_state_name: QualifiedName,
}

impl SetStateEventArgs {
    pub fn new(target_state_name: impl Into<QualifiedName>) -> Self {
        Self {
            target_state_name: target_state_name.into(),
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({ "target_state_name": self.target_state_name.0 })
    }

    pub fn from_payload(payload: serde_json::Value) -> crate::WorkflowResult<Self> {
        Ok(serde_json::from_value(payload)?)
    }
}
