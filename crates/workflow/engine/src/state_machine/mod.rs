//! Hierarchical state machine execution
//!
//! A `StateMachine` root owns a [`StateMachineExecutionState`]: the active
//! leaf, a pending transition target, a FIFO of [`StateMachineAction`]s and
//! the [`StateMachineSubscriptionManager`]. States run as nested execution
//! contexts of their parent state. At most one child activity of the whole
//! machine is scheduled at a time; everything else waits in the action
//! queue until it reports back.

mod actions;
mod execution_state;
mod helpers;
mod state;
mod subscriptions;

pub use execution_state::{execution_state, StateMachineAction, StateMachineExecutionState};
pub use helpers::root_state_of;
pub use state::StateActivity;
pub use subscriptions::{
    EventActivitySubscription, SetStateSubscription, StateMachineSubscription,
    StateMachineSubscriptionManager,
};

pub(crate) use actions::resume_actions;
