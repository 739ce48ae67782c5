//! Activity Model for Flowstate
//!
//! Flowstate executes workflows shaped as a tree of composite activities.
//! This crate holds the declarative side of that tree and the vocabulary
//! shared with the engine; it has no runtime behaviour of its own.
//!
//! # Key Concepts
//!
//! - **ActivityDefinition**: A node of the workflow tree. Composite kinds
//!   (sequence, parallel, listen, conditioned activity group, replicator,
//!   event handling scope, states) own an ordered list of children.
//! - **ExecutionStatus**: The per-activity lifecycle
//!   `Initialized -> Executing -> {Closed | Canceling -> Closed | Faulting -> Closed}`.
//! - **ActivityCondition**: `When`/`Until` conditions evaluated against the
//!   instance variables.
//! - **QualifiedName**: The identity of an activity, unique within a
//!   workflow instance.
//! - **SetStateEventArgs**: The payload a host posts on the set-state queue
//!   to force a state machine transition.
//!
//! # Design Principles
//!
//! 1. Definitions are plain data. Validation is a pass/fail boundary.
//! 2. Every runtime invariant violation is a typed [`WorkflowError`].

#![deny(unsafe_code)]

mod condition;
mod definition;
mod errors;
mod events;
mod ids;
mod status;

pub use condition::*;
pub use definition::*;
pub use errors::*;
pub use events::*;
pub use ids::*;
pub use status::*;
