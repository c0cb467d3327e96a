//! State machine module.

pub mod machine;

pub use machine::{SessionStateMachine, Transition, UwbsState};
