//! Activity execution: retry policies, timeouts, and liveness heartbeats.
//!
//! Workflows never call an activity directly; they wrap the call in
//! [`run_with_retry`] so every activity gets a start-to-close timeout,
//! exponential backoff, and cancellation awareness.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessingError, Result};

/// Retry schedule for one class of activity.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Budget for a single attempt.
    pub start_to_close: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff: f64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Profile for long-running activities: chunk reads and batch
    /// processing.
    pub fn long() -> Self {
        Self {
            start_to_close: Duration::from_secs(2 * 60 * 60),
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(10 * 60),
            backoff: 2.0,
            max_attempts: 3,
        }
    }

    /// Profile for quick activities: boundary calculation, progress upserts,
    /// finalization, failure recording.
    pub fn short() -> Self {
        Self {
            start_to_close: Duration::from_secs(5 * 60),
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(2 * 60),
            backoff: 1.5,
            max_attempts: 5,
        }
    }

    /// Profile for job-level activities: analysis, failed-record fetch, the
    /// reprocess pass, and job finalization.
    pub fn standard() -> Self {
        Self {
            start_to_close: Duration::from_secs(30 * 60),
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(5 * 60),
            backoff: 2.0,
            max_attempts: 5,
        }
    }
}

/// Run an activity under a retry policy.
///
/// The attempt factory is invoked once per attempt. Non-retryable errors and
/// cancellation short-circuit; a timed-out attempt counts as a retryable
/// failure. After the last attempt the last error is returned wrapped in
/// [`ProcessingError::RetriesExhausted`].
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &'static str,
    attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_with_retry_observed(policy, cancel, label, attempt, |_, _| {}).await
}

/// [`run_with_retry`] with a hook invoked before each re-attempt, carrying
/// the attempt number just failed and its error.
pub async fn run_with_retry_observed<T, F, Fut, N>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &'static str,
    mut attempt: F,
    mut on_retry: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(u32, &ProcessingError),
{
    let mut interval = policy.initial_interval;

    for attempt_number in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessingError::Cancelled),
            outcome = tokio::time::timeout(policy.start_to_close, attempt()) => outcome,
        };

        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_elapsed) => ProcessingError::Timeout(policy.start_to_close),
        };

        if attempt_number == policy.max_attempts {
            tracing::error!(
                activity = label,
                attempts = attempt_number,
                error = %error,
                "activity exhausted its retries"
            );
            return Err(ProcessingError::RetriesExhausted {
                attempts: attempt_number,
                source: Box::new(error),
            });
        }

        tracing::warn!(
            activity = label,
            attempt = attempt_number,
            retry_in = ?interval,
            error = %error,
            "activity attempt failed, retrying"
        );
        on_retry(attempt_number, &error);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessingError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
        interval = interval.mul_f64(policy.backoff).min(policy.max_interval);
    }

    // Only reachable with a zero-attempt policy.
    Err(ProcessingError::RetriesExhausted {
        attempts: 0,
        source: Box::new(ProcessingError::Timeout(policy.start_to_close)),
    })
}

/// Liveness signal emitted by long-running activities.
///
/// The activity side calls [`Heartbeat::beat`]; the observing side reads the
/// latest beat time and the total count. Beats are cheap and never block.
pub struct Heartbeat {
    tx: watch::Sender<DateTime<Utc>>,
    count: Arc<AtomicU64>,
}

/// Read side of a [`Heartbeat`].
#[derive(Clone)]
pub struct HeartbeatObserver {
    rx: watch::Receiver<DateTime<Utc>>,
    count: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn new() -> (Self, HeartbeatObserver) {
        let (tx, rx) = watch::channel(Utc::now());
        let count = Arc::new(AtomicU64::new(0));
        (
            Self {
                tx,
                count: count.clone(),
            },
            HeartbeatObserver { rx, count },
        )
    }

    pub fn beat(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Utc::now());
    }
}

impl HeartbeatObserver {
    pub fn last_beat(&self) -> DateTime<Utc> {
        *self.rx.borrow()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
