//! Runtime configuration

use serde::{Deserialize, Serialize};

/// Configuration for a [`WorkflowRuntime`](crate::WorkflowRuntime)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Name of the host-facing queue that accepts `SetStateEventArgs`
    pub set_state_queue_name: String,
    /// Upper bound on work items processed by one `run` call
    pub max_work_items_per_run: usize,
    /// Whether the execution trace keeps records
    pub trace_enabled: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set_state_queue_name(mut self, name: impl Into<String>) -> Self {
        self.set_state_queue_name = name.into();
        self
    }

    pub fn with_max_work_items_per_run(mut self, limit: usize) -> Self {
        self.max_work_items_per_run = limit;
        self
    }

    pub fn with_trace_enabled(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            set_state_queue_name: "SetStateQueue".to_string(),
            max_work_items_per_run: 100_000,
            trace_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.set_state_queue_name, "SetStateQueue");
        assert_eq!(config.max_work_items_per_run, 100_000);
        assert!(config.trace_enabled);
    }

    #[test]
    fn test_builder_and_serde() {
        let config = RuntimeConfig::new()
            .with_set_state_queue_name("transitions")
            .with_max_work_items_per_run(50)
            .with_trace_enabled(false);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.max_work_items_per_run, 50);
    }
}
