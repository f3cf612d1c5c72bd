use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::error::{ConfigError, SourceError};
use crate::source::TickSource;

/// Bounded exponential backoff for (re)connecting a [`TickSource`].
///
/// The delay before attempt `n + 1` is `base_delay * 2^n`, capped at
/// `max_delay`. No delay follows the final attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    ///
    /// # Arguments
    ///
    /// * `attempts` - Total connection attempts, including the first.
    /// * `base_delay` - Delay after the first failure; doubled after each one.
    /// * `max_delay` - Upper bound on any single delay.
    pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay,
        }
    }

    /// Reject a policy that would never attempt to connect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempts == 0 {
            return Err(ConfigError::TooSmall {
                name: "retry.attempts",
                min: 1,
                value: 0,
            });
        }
        Ok(())
    }

    /// Delays slept between consecutive attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let gaps = self.attempts.saturating_sub(1) as usize;
        std::iter::successors(Some(self.base_delay.min(self.max_delay)), move |d| {
            Some(d.saturating_mul(2).min(self.max_delay))
        })
        .take(gaps)
    }

    /// Connect `source`, retrying with backoff until the policy is exhausted.
    ///
    /// Returns the last connection error when every attempt failed.
    pub async fn connect(&self, source: &dyn TickSource) -> Result<(), SourceError> {
        let mut delays = self.delays();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match source.connect().await {
                Ok(()) => {
                    debug!("Connected on attempt {attempt}/{}", self.attempts);
                    return Ok(());
                }
                Err(e) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            "Connect attempt {attempt}/{} failed: {e}; retrying in {:.1}s",
                            self.attempts,
                            delay.as_secs_f64()
                        );
                        sleep(delay).await;
                    }
                    None => {
                        warn!("Connect attempt {attempt}/{} failed: {e}; giving up", self.attempts);
                        return Err(e);
                    }
                },
            }
        }
    }
}
