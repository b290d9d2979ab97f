//! Quorum barriers over signal streams.
//!
//! A [`QuorumBarrier`] counts matching events and runs its continuation
//! exactly once, when the count first reaches the required value. A
//! [`QuorumSignalBarrier`] feeds a barrier from trace signal streams and
//! races it against a deadline fixed when it is armed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::poll::{race_deadline, Deadline};
use crate::signal::{Signal, SignalStream};

type Continuation = Box<dyn FnOnce(usize) + Send>;

/// Counter that fires once at `required` matching events
pub struct QuorumBarrier {
    required: usize,
    count: AtomicUsize,
    fired: AtomicBool,
    continuation: Mutex<Option<Continuation>>,
}

impl QuorumBarrier {
    pub fn new(required: usize) -> Self {
        Self {
            required,
            count: AtomicUsize::new(0),
            fired: AtomicBool::new(false),
            continuation: Mutex::new(None),
        }
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Record one event. Returns true only for the event that fired the barrier.
    pub fn increment(&self, matches: bool) -> bool {
        if !matches {
            return false;
        }
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        count >= self.required && self.fire(count)
    }

    /// Register the continuation. Runs immediately if the quorum is already met.
    pub fn on_fired(&self, continuation: impl FnOnce(usize) + Send + 'static) {
        {
            let mut slot = self.continuation.lock();
            if !self.has_fired() {
                *slot = Some(Box::new(continuation));
                drop(slot);
                // Covers `required == 0` and counts reached before registration
                let count = self.count();
                if count >= self.required {
                    self.fire(count);
                }
                return;
            }
        }
        continuation(self.count());
    }

    /// Drop the continuation without running it.
    pub fn disarm(&self) {
        self.continuation.lock().take();
    }

    fn fire(&self, count: usize) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let continuation = self.continuation.lock().take();
        if let Some(continuation) = continuation {
            continuation(count);
        }
        true
    }
}

impl std::fmt::Debug for QuorumBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumBarrier")
            .field("required", &self.required)
            .field("count", &self.count())
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// How a quorum wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumOutcome {
    Reached { count: usize, elapsed: Duration },
    TimedOut { count: usize, required: usize },
}

impl QuorumOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, QuorumOutcome::Reached { .. })
    }
}

/// Counts matching signals across peers until a quorum or a deadline
pub struct QuorumSignalBarrier {
    barrier: Arc<QuorumBarrier>,
    fired_rx: Option<oneshot::Receiver<usize>>,
    listeners: Vec<JoinHandle<()>>,
    armed_at: Instant,
    deadline: Instant,
}

impl QuorumSignalBarrier {
    /// Start counting signals from `streams` that satisfy `predicate`.
    /// The deadline clock starts now.
    pub fn arm<P>(
        streams: Vec<SignalStream>,
        required: usize,
        timeout: Duration,
        predicate: P,
    ) -> Self
    where
        P: Fn(&Signal) -> bool + Send + Sync + 'static,
    {
        let armed_at = Instant::now();
        let barrier = Arc::new(QuorumBarrier::new(required));
        let (fired_tx, fired_rx) = oneshot::channel();
        barrier.on_fired(move |count| {
            let _ = fired_tx.send(count);
        });

        let predicate = Arc::new(predicate);
        let listeners = streams
            .into_iter()
            .map(|mut stream| {
                let barrier = barrier.clone();
                let predicate = predicate.clone();
                tokio::spawn(async move {
                    while let Some(signal) = stream.next().await {
                        if barrier.increment(predicate(&signal)) {
                            tracing::debug!(count = barrier.count(), "Quorum reached");
                        }
                    }
                })
            })
            .collect();

        tracing::debug!(required, timeout_ms = timeout.as_millis() as u64, "Quorum barrier armed");
        Self {
            barrier,
            fired_rx: Some(fired_rx),
            listeners,
            armed_at,
            deadline: armed_at + timeout,
        }
    }

    /// Matching signals seen so far
    pub fn count(&self) -> usize {
        self.barrier.count()
    }

    /// Wait for the quorum or the deadline, whichever comes first.
    pub async fn wait(mut self) -> QuorumOutcome {
        let outcome = match self.fired_rx.take() {
            Some(fired_rx) => race_deadline(fired_rx, self.deadline).await,
            None => Deadline::Expired,
        };

        let outcome = match outcome {
            Deadline::Completed(Ok(count)) => QuorumOutcome::Reached {
                count,
                elapsed: self.armed_at.elapsed(),
            },
            Deadline::Completed(Err(_)) | Deadline::Expired => {
                self.barrier.disarm();
                QuorumOutcome::TimedOut {
                    count: self.barrier.count(),
                    required: self.barrier.required(),
                }
            }
        };
        match outcome {
            QuorumOutcome::Reached { count, .. } => tracing::info!(count, "Quorum reached"),
            QuorumOutcome::TimedOut { count, required } => {
                tracing::warn!(count, required, "Quorum deadline passed")
            }
        }
        outcome
    }

    /// Continuation form of [`wait`](Self::wait): exactly one of the two
    /// callbacks runs.
    pub async fn settle<T>(
        self,
        on_reached: impl FnOnce(usize) -> T,
        on_timeout: impl FnOnce(usize, usize) -> T,
    ) -> T {
        match self.wait().await {
            QuorumOutcome::Reached { count, .. } => on_reached(count),
            QuorumOutcome::TimedOut { count, required } => on_timeout(count, required),
        }
    }
}

impl Drop for QuorumSignalBarrier {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}
