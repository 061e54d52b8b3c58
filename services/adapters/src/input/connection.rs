//! Connection establishment with exponential backoff

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use types::ConnectionBackoffPolicy;

use crate::error::{ConnectionError, TransportError};

/// Iterator over retry delays for one connection attempt sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ConnectionBackoffPolicy,
    retries: u32,
}

impl Backoff {
    /// Start a fresh sequence
    pub fn new(policy: ConnectionBackoffPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Delay before the next attempt, or `None` once all attempts are used
    ///
    /// Call after each failed attempt.
    pub fn next_delay(&mut self) -> Option<Duration> {
        // `steps` counts attempts, so there are `steps - 1` waits between them
        if self.retries + 1 >= self.policy.steps {
            return None;
        }
        let base = self.policy.delay(self.retries);
        self.retries += 1;
        Some(self.with_jitter(base))
    }

    fn with_jitter(&self, base: Duration) -> Duration {
        if self.policy.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let slack = rand::thread_rng().gen_range(0.0..=self.policy.jitter);
        base.saturating_add(base.mul_f64(slack))
    }

    /// Attempts allowed by the policy
    pub fn max_attempts(&self) -> u32 {
        self.policy.steps
    }
}

/// Run `attempt` until it succeeds or the backoff policy is exhausted
///
/// Each failure is logged with the attempt number and the next delay. When
/// the last attempt fails, the returned [`ConnectionError`] wraps that
/// failure and names `address`. Waiting uses the Tokio timer, so the calling
/// task is suspended rather than the thread.
pub async fn establish<T, F, Fut>(
    address: &str,
    policy: &ConnectionBackoffPolicy,
    mut attempt: F,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut backoff = Backoff::new(policy.clone());
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match attempt().await {
            Ok(connection) => {
                info!(address, attempts, "connection established");
                return Ok(connection);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        address,
                        attempt = attempts,
                        max_attempts = backoff.max_attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(ConnectionError {
                        address: address.to_string(),
                        attempts,
                        source: e,
                    });
                }
            },
        }
    }
}
