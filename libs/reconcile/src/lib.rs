//! Bounded poll and retry primitives.
//!
//! Every wait in the node agent is expressed as a number of attempts spaced by
//! a fixed interval rather than a wall-clock deadline. The effective timeout
//! is `attempts * interval`.
//!
//! # Invariants
//!
//! - A probe is called at most `attempts` times
//! - Sleeps happen only between attempts, never after the last one
//! - An error returned by a probe ends the poll immediately

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// Condition never held within the attempt budget.
    #[error("condition not met after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// Probe failed.
    #[error(transparent)]
    Probe(E),
}

/// Attempt budget and spacing for a poll or retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of attempts.
    pub attempts: u32,

    /// Delay between attempts.
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Largest attempt count whose sleep budget fits within `cap`.
    pub fn capped(self, cap: Duration) -> Self {
        if self.interval.is_zero() {
            return self;
        }
        let fit = (cap.as_millis() / self.interval.as_millis().max(1)) as u32 + 1;
        Self {
            attempts: self.attempts.min(fit),
            interval: self.interval,
        }
    }
}

/// Poll `probe` until it yields a value.
///
/// The probe receives the zero-based attempt number and returns `Ok(Some(_))`
/// when the condition holds, `Ok(None)` to keep polling.
pub async fn poll_until<T, E, F, Fut>(policy: PollPolicy, mut probe: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 0..policy.attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.interval).await;
        }

        if let Some(value) = probe(attempt).await.map_err(PollError::Probe)? {
            return Ok(value);
        }
    }

    Err(PollError::Exhausted {
        attempts: policy.attempts,
    })
}

/// Run `op` until it succeeds, returning the last error once attempts run out.
pub async fn retry<T, E, F, Fut>(policy: PollPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts => {
                debug!(attempt, error = %e, "Attempt failed, retrying");
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
