//! Custom Resource Definitions for the stack operator

mod stack;

pub use stack::{Stack, StackSpec, StackState, StackStatus};
