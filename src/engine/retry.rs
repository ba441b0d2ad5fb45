//! Per-resource retry policy.
//!
//! Transient gateway failures are retried with a linear backoff: no pause
//! before the first retry, then one more step per further attempt
//! (0s, 1s, 2s, 3s with the default five attempts). Anything the provider
//! rejects outright is returned immediately.
use crate::gateway::GatewayError;
use std::time::Duration;
use thiserror::Error;

/// Total attempts per resource, including the first.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_step: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("rejected: {0}")]
    Rejected(GatewayError),
    #[error("{attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: GatewayError },
}

impl RetryPolicy {
    /// Pause taken after `failed_attempts` consecutive transient failures.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        self.backoff_step * failed_attempts.saturating_sub(1)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub fn run<T>(
        &self,
        resource_id: &str,
        mut op: impl FnMut() -> Result<T, GatewayError>,
    ) -> Result<T, RetryError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(RetryError::Rejected(err)),
                Err(err) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
                Err(err) => {
                    let pause = self.backoff(attempt);
                    tracing::warn!(
                        resource_id,
                        code = err.code(),
                        attempt,
                        wait_secs = pause.as_secs(),
                        "encountered error {err} on {resource_id}, retrying"
                    );
                    if !pause.is_zero() {
                        std::thread::sleep(pause);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
