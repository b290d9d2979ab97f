//! Bounded polling and deadline races.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Attempts before giving up; zero is treated as one
    pub max_attempts: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

/// How a poll ended
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Converged { value: T, attempts: u32 },
    /// Attempts ran out; `last` is the final value observed
    Exhausted { last: T, attempts: u32 },
}

impl<T> PollOutcome<T> {
    pub fn is_converged(&self) -> bool {
        matches!(self, PollOutcome::Converged { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Converged { attempts, .. } | PollOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_value(self) -> T {
        match self {
            PollOutcome::Converged { value, .. } => value,
            PollOutcome::Exhausted { last, .. } => last,
        }
    }
}

/// Run `operation` until `predicate` accepts its value or attempts run out.
///
/// The operation receives the 1-based attempt number. Each attempt is
/// independent; nothing is carried over between them. An operation error
/// ends the poll immediately.
pub async fn poll<T, E, Op, Fut, P>(
    mut operation: Op,
    mut predicate: P,
    options: PollOptions,
) -> Result<PollOutcome<T>, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let value = operation(attempt).await?;
        if predicate(&value) {
            return Ok(PollOutcome::Converged {
                value,
                attempts: attempt,
            });
        }
        if attempt >= max_attempts {
            return Ok(PollOutcome::Exhausted {
                last: value,
                attempts: attempt,
            });
        }
        tokio::time::sleep(options.interval).await;
        attempt += 1;
    }
}

/// Result of racing a future against a deadline
#[derive(Debug, PartialEq)]
pub enum Deadline<T> {
    Completed(T),
    Expired,
}

/// Race `fut` against `deadline`. A future that is ready at the deadline wins.
pub async fn race_deadline<F: Future>(fut: F, deadline: Instant) -> Deadline<F::Output> {
    tokio::select! {
        biased;
        output = fut => Deadline::Completed(output),
        _ = tokio::time::sleep_until(deadline) => Deadline::Expired,
    }
}
