//! Readiness polling with a deadline.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use keel_core::config::ProbeConfig;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Ready,
    /// Deadline elapsed with the condition still false. Expected and recoverable.
    TimedOut,
    /// The condition could not be evaluated: too many consecutive query errors.
    ProbeError(String),
    Cancelled,
}

/// Polls a side-effect-free predicate until it holds, the deadline passes, or the
/// cancellation token fires. Never busy-spins: every miss sleeps at least one interval
/// (clamped to the deadline), growing by `backoff_multiplier` up to the configured cap.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    cfg: ProbeConfig,
    cancel: CancellationToken,
}

impl ReadinessProbe {
    pub fn new(cfg: ProbeConfig, cancel: CancellationToken) -> Self {
        Self { cfg, cancel }
    }

    /// Wait using the configured timeout and poll interval.
    pub async fn wait<F, Fut, E>(&self, what: &str, predicate: F) -> ProbeOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: Display,
    {
        self.wait_for(what, predicate, self.cfg.timeout(), self.cfg.poll_interval()).await
    }

    pub async fn wait_for<F, Fut, E>(&self, what: &str, mut predicate: F, timeout: Duration, poll_interval: Duration) -> ProbeOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: Display,
    {
        let deadline = deadline_after(timeout);
        let max_interval = self.cfg.max_poll_interval().max(poll_interval);
        let max_errors = self.cfg.max_consecutive_errors.max(1);
        let mut interval = poll_interval;
        let mut errors = 0u32;
        let mut polls = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return ProbeOutcome::Cancelled;
            }
            polls += 1;
            counter!("probe_polls_total", 1u64);
            match predicate().await {
                Ok(true) => {
                    debug!(what, polls, "condition ready");
                    return ProbeOutcome::Ready;
                }
                Ok(false) => errors = 0,
                Err(e) => {
                    errors += 1;
                    if errors >= max_errors {
                        warn!(what, errors, error = %e, "condition unknowable; giving up");
                        counter!("probe_errors_total", 1u64);
                        return ProbeOutcome::ProbeError(e.to_string());
                    }
                    debug!(what, errors, error = %e, "query failed; treating as not ready");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(what, polls, "deadline reached");
                return ProbeOutcome::TimedOut;
            }
            let nap = interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return ProbeOutcome::Cancelled,
                _ = tokio::time::sleep(nap) => {}
            }
            interval = Duration::from_secs_f64(
                (interval.as_secs_f64() * self.cfg.backoff_multiplier.max(1.0)).min(max_interval.as_secs_f64()),
            );
        }
    }
}

/// `now + d`; a duration too large for the clock yields a deadline that never arrives.
pub fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);
