//! Status write suppression
//!
//! Turns a poll outcome into the next observed status and decides whether it
//! is worth writing. An unchanged, healthy stack never produces a write, so a
//! resync of a settled stack is free.

use std::collections::BTreeMap;

use crate::crd::{StackState, StackStatus};
use crate::lifecycle::Operation;
use crate::poller::PollOutcome;
use crate::provider::StackStatusCode;

/// Whether to write a status
#[derive(Clone, Debug, PartialEq)]
pub enum StatusDecision {
    /// Keep the previous status
    Skip,
    /// Write this status
    Persist(StackStatus),
}

/// Compare outputs as sets of key/value pairs; absent equals empty
pub fn outputs_equal(
    left: Option<&BTreeMap<String, String>>,
    right: Option<&BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    let left = left.unwrap_or(&empty);
    let right = right.unwrap_or(&empty);
    left.len() == right.len() && left.iter().all(|(k, v)| right.get(k) == Some(v))
}

fn next_state(operation: Operation, status: &StackStatusCode, rejected: bool) -> StackState {
    if rejected || status.is_failure() {
        return StackState::Error;
    }
    match operation {
        Operation::Create => StackState::Created,
        Operation::Update => StackState::Updated,
        Operation::Delete if *status == StackStatusCode::DeleteComplete => StackState::Deleted,
        Operation::Delete => StackState::Error,
    }
}

/// Build the status a poll outcome implies
///
/// `rejection` is the engine's refusal of our own request, if any; it marks
/// the operation failed whatever the stack settled into.
pub fn observed_status(
    previous: Option<&StackStatus>,
    outcome: &PollOutcome,
    operation: Operation,
    rejection: Option<&str>,
) -> StackStatus {
    match outcome {
        PollOutcome::Absent => {
            let state = match (operation, rejection) {
                (Operation::Delete, None) => StackState::Deleted,
                _ => StackState::Error,
            };
            let message = rejection.map(str::to_string).or_else(|| {
                (state == StackState::Error).then(|| "stack not found after request".to_string())
            });
            StackStatus {
                stack_id: previous.and_then(|p| p.stack_id.clone()),
                outputs: None,
                state: Some(state),
                message,
            }
        }
        PollOutcome::Terminal(record) => StackStatus {
            stack_id: record
                .stack_id
                .clone()
                .or_else(|| previous.and_then(|p| p.stack_id.clone())),
            outputs: record.outputs_map(),
            state: Some(next_state(operation, &record.status, rejection.is_some())),
            message: rejection
                .map(str::to_string)
                .or_else(|| record.status_reason.clone()),
        },
    }
}

/// Decide whether the outcome of a reconcile must be written
///
/// A write happens when any of these hold: the operation was a create, there
/// is no previous status, the stack id changed, the outputs changed, or the
/// health of the state changed. An ERROR status is also rewritten when its
/// message changed.
pub fn reconcile_status(
    previous: Option<&StackStatus>,
    outcome: &PollOutcome,
    operation: Operation,
    rejection: Option<&str>,
) -> StatusDecision {
    let next = observed_status(previous, outcome, operation, rejection);

    let Some(prev) = previous else {
        return StatusDecision::Persist(next);
    };

    let changed = operation == Operation::Create
        || prev.stack_id != next.stack_id
        || !outputs_equal(prev.outputs.as_ref(), next.outputs.as_ref())
        || prev.is_healthy() != next.is_healthy()
        || (next.state == Some(StackState::Error) && prev.message != next.message);

    if changed {
        StatusDecision::Persist(next)
    } else {
        StatusDecision::Skip
    }
}
