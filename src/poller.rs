//! Completion polling
//!
//! Describes the stack until it reaches a status in the requested terminal
//! set or disappears. Describe failures are retried at the same interval and
//! are never read as "absent". The loop ends early only through its
//! [`CallScope`].

use std::time::Duration;

use tracing::{debug, warn};

use crate::provider::{StackProvider, StackRecord, TerminalSet};
use crate::scope::CallScope;
use crate::Result;

/// How a poll ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Stack reached a terminal status
    Terminal(StackRecord),
    /// Describe returned nothing: never created, or fully deleted
    Absent,
}

/// Polls the engine at a fixed interval
#[derive(Clone, Copy, Debug)]
pub struct CompletionPoller {
    interval: Duration,
}

impl CompletionPoller {
    /// Create a poller sleeping `interval` between describes
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Wait until `name` reaches a status in `terminal_set` or is absent
    pub async fn wait_for_terminal(
        &self,
        provider: &dyn StackProvider,
        name: &str,
        terminal_set: TerminalSet,
        scope: &CallScope,
    ) -> Result<PollOutcome> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match scope
                .run("describe_stacks", provider.describe_stacks(name))
                .await
            {
                Ok(records) if records.is_empty() => {
                    debug!(stack = %name, attempt, "stack absent");
                    return Ok(PollOutcome::Absent);
                }
                Ok(records) => {
                    if let Some(record) = records
                        .iter()
                        .find(|r| terminal_set.contains(&r.status))
                    {
                        debug!(
                            stack = %name,
                            status = %record.status,
                            attempt,
                            "stack reached terminal status"
                        );
                        return Ok(PollOutcome::Terminal(record.clone()));
                    }
                    debug!(
                        stack = %name,
                        status = %records[0].status,
                        expected = %terminal_set,
                        attempt,
                        "waiting for terminal status"
                    );
                }
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => {
                    warn!(stack = %name, error = %e, attempt, "describe failed, retrying");
                }
            }

            scope.sleep(self.interval).await?;
        }
    }
}
