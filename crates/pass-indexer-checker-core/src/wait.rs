//! Bounded polling for eventually-consistent reads.
//!
//! The index is fed asynchronously from the repository, so a write is not
//! visible through a search until some time later. [`poll_until`] re-runs a
//! probe on a fixed interval until it reports [`Probe::Ready`], the attempt
//! budget runs out, an optional deadline passes, or the [`CancelToken`] fires.
//!
//! A probe separates "not there yet" ([`Probe::NotReady`]) from failures
//! (`Err`). Failures are only retried when [`Error::is_retryable`] says so;
//! anything else aborts the poll on first sight.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Remediation, Result};

/// Interval and budget for a poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Fixed delay between attempts (default: 3s).
    pub interval: Duration,
    /// Maximum number of probe calls, including the first (default: 50).
    pub max_attempts: u32,
    /// Optional wall-clock limit. When unset the attempt budget alone bounds the loop.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 50,
            timeout: None,
        }
    }
}

impl PollPolicy {
    #[must_use]
    pub fn new(interval: Duration, max_attempts: u32, timeout: Option<Duration>) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    /// Worst-case time spent sleeping before the poll gives up.
    #[must_use]
    pub fn total_budget(&self) -> Duration {
        let implied = self
            .interval
            .saturating_mul(self.max_attempts.saturating_sub(1));
        self.timeout.map_or(implied, |timeout| timeout.min(implied))
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Condition holds.
    Ready(T),
    /// Condition does not hold yet.
    NotReady { observed: Option<String> },
}

impl<T> Probe<T> {
    #[must_use]
    pub fn not_ready(observed: impl Into<String>) -> Self {
        Self::NotReady {
            observed: Some(observed.into()),
        }
    }
}

/// Successful poll outcome.
#[derive(Debug, Clone)]
pub struct Polled<T> {
    pub value: T,
    /// Probe calls made, including the successful one.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> Polled<T> {
    /// Sleeps taken before the condition held.
    #[must_use]
    pub fn sleeps(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Why a poll ended without observing its condition.
#[derive(Error, Debug)]
pub enum PollError {
    #[error(
        "retry budget exhausted after {attempts} attempts ({}ms) waiting for {expected}; last observed: {}",
        .elapsed.as_millis(),
        .last_observed.as_deref().unwrap_or("<none>")
    )]
    Exhausted {
        expected: String,
        attempts: u32,
        elapsed: Duration,
        last_observed: Option<String>,
        #[source]
        last_error: Option<Box<Error>>,
    },

    #[error("cancelled after {attempts} attempts while waiting for {expected}")]
    Cancelled { expected: String, attempts: u32 },

    #[error("gave up waiting for {expected}")]
    Aborted {
        expected: String,
        #[source]
        source: Box<Error>,
    },
}

impl PollError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Exhausted { .. } => Remediation::new(
                "The index did not reflect the repository change in time. Check the indexer.",
            )
            .command(
                "Find sentinel",
                "curl -s \"$PASS_ELASTICSEARCH_URL/pass/_search?q=locatorIds:infinity\"",
            )
            .alternative("Raise check.retries or check.poll_interval_secs if the indexer is slow."),
            Self::Cancelled { .. } => Remediation::new(
                "The run was interrupted. The sentinel may remain; the next run removes it.",
            )
            .command("Rerun", "pass-indexer-checker"),
            Self::Aborted { source, .. } => source.remediation().unwrap_or_else(|| {
                Remediation::new("A non-transient error stopped the poll.")
                    .command("Rerun with debug logs", "RUST_LOG=debug pass-indexer-checker")
            }),
        }
    }
}

/// Handle that requests cancellation of every linked [`CancelToken`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal observed by poll sleeps.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a linked handle/token pair.
    #[must_use]
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::new().1
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Poll `probe` until it reports ready.
///
/// Attempt `k` is followed by a sleep of `policy.interval` only when another
/// attempt remains, so success on attempt `k` costs exactly `k - 1` sleeps and
/// exhaustion costs `max_attempts - 1`.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancelToken,
    expected: &str,
    mut probe: F,
) -> std::result::Result<Polled<T>, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    let start = Instant::now();
    let deadline = policy.timeout.map(|timeout| start + timeout);
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;
    let mut last_observed = None;
    let mut last_error: Option<Box<Error>>;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled {
                expected: expected.to_string(),
                attempts,
            });
        }

        attempts += 1;
        match probe().await {
            Ok(Probe::Ready(value)) => {
                if attempts > 1 {
                    debug!(
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        expected,
                        "Condition observed after polling"
                    );
                }
                return Ok(Polled {
                    value,
                    attempts,
                    elapsed: start.elapsed(),
                });
            }
            Ok(Probe::NotReady { observed }) => {
                if observed.is_some() {
                    last_observed = observed;
                }
                last_error = None;
            }
            Err(e) if e.is_retryable() => {
                debug!(attempt = attempts, error = %e, "Transient failure while polling");
                last_error = Some(Box::new(e));
            }
            Err(e) => {
                return Err(PollError::Aborted {
                    expected: expected.to_string(),
                    source: Box::new(e),
                });
            }
        }

        let now = Instant::now();
        let deadline_passed = deadline.is_some_and(|d| now >= d);
        if attempts >= max_attempts || deadline_passed {
            warn!(
                attempts,
                max_attempts,
                elapsed_ms = now.saturating_duration_since(start).as_millis() as u64,
                expected,
                "Retry budget exhausted"
            );
            return Err(PollError::Exhausted {
                expected: expected.to_string(),
                attempts,
                elapsed: now.saturating_duration_since(start),
                last_observed,
                last_error,
            });
        }

        let delay = deadline.map_or(policy.interval, |d| {
            policy.interval.min(d.saturating_duration_since(now))
        });
        info!(
            attempt = attempts,
            max_attempts,
            observed = last_observed.as_deref().unwrap_or("<error>"),
            "... waiting for index to update"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                warn!(attempts, expected, "Poll cancelled");
                return Err(PollError::Cancelled {
                    expected: expected.to_string(),
                    attempts,
                });
            }
        }
    }
}
