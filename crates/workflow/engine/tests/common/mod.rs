//! Shared helpers for the engine integration tests

#![allow(dead_code)]

use flowstate_engine::{RuntimeConfig, TraceEvent, WorkflowRuntime};
use flowstate_types::*;
use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Route engine logs to the test output. Honors `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "flowstate_engine=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().without_time().with_test_writer())
            .try_init();
    });
}

/// Instantiate and start a definition
pub fn start(definition: &ActivityDefinition) -> WorkflowRuntime {
    init_tracing();
    let mut runtime = WorkflowRuntime::new(definition, RuntimeConfig::default()).unwrap();
    runtime.start().unwrap();
    runtime
}

/// Instantiate with seeded variables and start
pub fn start_with(definition: &ActivityDefinition, variables: &[(&str, &str)]) -> WorkflowRuntime {
    init_tracing();
    let mut runtime = WorkflowRuntime::new(definition, RuntimeConfig::default()).unwrap();
    for (name, value) in variables {
        runtime = runtime.with_variable(*name, *value);
    }
    runtime.start().unwrap();
    runtime
}

/// Code activity that bumps a counter
pub fn counter(name: &str, variable: &str) -> ActivityDefinition {
    ActivityDefinition::code(name).with_update(VariableUpdate::increment(variable))
}

/// Sequence number of the first status change of `activity` to `status`
pub fn status_position(runtime: &WorkflowRuntime, activity: &str, status: ExecutionStatus) -> Option<u64> {
    runtime.trace().position(|event| {
        matches!(
            event,
            TraceEvent::StatusChanged { activity: name, status: s, .. }
                if name.as_str() == activity && *s == status
        )
    })
}

/// How many times an activity (or any clone of it) started executing
pub fn executions(runtime: &WorkflowRuntime, activity: &str) -> usize {
    runtime
        .trace()
        .status_changes(activity)
        .into_iter()
        .filter(|s| *s == ExecutionStatus::Executing)
        .count()
}

pub fn names(values: &[&str]) -> Vec<QualifiedName> {
    values.iter().map(|v| QualifiedName::new(*v)).collect()
}
