//! Wait monitor
//!
//! Polls `describe` until a remote object settles, backing off between
//! polls and never sleeping past the deadline.

use crate::context::CancelToken;
use crate::provider::{Observation, Provider, ProviderError, RemoteStatus};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Polling configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    /// Delay before the second poll
    pub poll_interval: Duration,
    /// Upper bound for any single delay
    pub max_poll_interval: Duration,
    /// Multiplier applied after each poll
    pub backoff_factor: f64,
    /// Total time allowed for one wait
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(30),
            backoff_factor: 1.5,
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl WaitConfig {
    /// Delay after the given (0-based) poll
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.poll_interval.as_secs_f64() * self.backoff_factor.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_poll_interval)
            .min(self.max_poll_interval)
    }
}

/// Terminal state to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Ready,
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out after {}s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    #[error("{message}")]
    Remote { message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Block until `remote_id` reaches `target`
pub fn wait_for(
    provider: &dyn Provider,
    kind: &str,
    remote_id: &str,
    target: WaitTarget,
    config: &WaitConfig,
    cancel: &CancelToken,
) -> Result<Observation, WaitError> {
    let start = Instant::now();
    let deadline = start + config.timeout;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        match provider.describe(kind, remote_id) {
            Ok(observation) => match (target, &observation.status) {
                (WaitTarget::Ready, RemoteStatus::Ready) | (WaitTarget::Gone, RemoteStatus::Gone) => {
                    log::debug!("{remote_id} reached {target:?} after {} poll(s)", attempt + 1);
                    return Ok(observation);
                }
                (_, RemoteStatus::Failed { reason }) => {
                    return Err(WaitError::Remote {
                        message: reason.clone(),
                    });
                }
                (WaitTarget::Ready, RemoteStatus::Gone) => {
                    return Err(WaitError::Remote {
                        message: format!("{remote_id} disappeared while waiting for it to become ready"),
                    });
                }
                (_, status) => log::trace!("{remote_id} is {status:?}"),
            },
            Err(ProviderError::NotFound { .. }) if target == WaitTarget::Gone => {
                log::debug!("{remote_id} is gone");
                return Ok(Observation::gone());
            }
            Err(ProviderError::NotFound { .. }) => {
                return Err(WaitError::Remote {
                    message: format!("{remote_id} disappeared while waiting for it to become ready"),
                });
            }
            Err(e) if e.is_retryable() => {
                log::warn!("describe {remote_id} failed, retrying: {e}");
            }
            Err(e) => {
                return Err(WaitError::Remote {
                    message: e.to_string(),
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout {
                elapsed: now - start,
            });
        }
        let delay = config.delay_for_attempt(attempt).min(deadline - now);
        attempt = attempt.saturating_add(1);
        log::trace!("polling {remote_id} again in {delay:?}");
        if cancel.sleep(delay) {
            return Err(WaitError::Cancelled);
        }
    }
}
