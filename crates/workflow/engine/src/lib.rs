//! Flowstate Execution Engine
//!
//! The engine runs workflow instances shaped as trees of composite
//! activities, including hierarchical state machines. It schedules
//! activity lifecycle work one item at a time, routes queue items to
//! listening activities, and lets a host reshape a running tree.
//!
//! # Key Principle
//!
//! **Composites never touch the scheduler directly.**
//!
//! Every composite drives its children through the
//! [`ActivityExecutionContext`] contract. The [`WorkflowRuntime`] owns the
//! arena, the work queue, nested execution contexts and the queuing
//! service, and is the only implementation of that contract.
//!
//! # Architecture
//!
//! - [`ActivityTree`]: Arena of activity nodes with stable handles
//! - [`activities`]: Sequence, Parallel, Listen, EventHandlingScope,
//!   conditioned activity group, Replicator and the leaf activities
//! - [`state_machine`]: State activities, the action queue and the
//!   subscription manager
//! - [`WorkflowQueuingService`]: Named FIFO queues with listeners
//! - [`ConditionEvaluator`]: `When`/`Until` conditions over instance variables
//! - [`ExecutionTrace`]: Ordered journal of everything an instance did
//!
//! # Example
//!
//! ```rust
//! use flowstate_engine::{RuntimeConfig, WorkflowOutcome, WorkflowRuntime};
//! use flowstate_types::*;
//!
//! let definition = ActivityDefinition::state_machine("order", "Created")
//!     .with_child(
//!         ActivityDefinition::state("Created").with_child(ActivityDefinition::on_event(
//!             "OnApproved",
//!             "approved",
//!             [ActivityDefinition::set_state("ToShipped", "Shipped")],
//!         )),
//!     )
//!     .with_child(ActivityDefinition::state("Shipped"))
//!     .with_completed_state("Shipped");
//!
//! let mut runtime = WorkflowRuntime::new(&definition, RuntimeConfig::default()).unwrap();
//! runtime.start().unwrap();
//! assert_eq!(
//!     runtime.state_machine_state("order").unwrap().current_state_name.as_ref().map(|s| s.as_str()),
//!     Some("Created")
//! );
//!
//! runtime.raise_event("approved", serde_json::json!({})).unwrap();
//! assert_eq!(runtime.outcome(), Some(&WorkflowOutcome::Completed));
//! ```

#![deny(unsafe_code)]

pub mod activities;
pub mod changes;
pub mod condition_evaluator;
pub mod config;
pub mod context;
pub mod queuing;
pub mod runtime;
pub mod state_machine;
pub mod trace;
pub mod tree;

// Re-export main types
pub use changes::StructuralChange;
pub use condition_evaluator::ConditionEvaluator;
pub use config::RuntimeConfig;
pub use context::{ActivityExecutionContext, Callback, RemovedActivity, WorkItem};
pub use queuing::{WorkflowQueue, WorkflowQueuingService};
pub use runtime::{WorkflowOutcome, WorkflowRuntime};
pub use state_machine::{StateMachineAction, StateMachineExecutionState, StateMachineSubscriptionManager};
pub use trace::{ExecutionTrace, TraceEvent, TraceRecord};
pub use tree::{ActivityNode, ActivityTree, NodeState};
