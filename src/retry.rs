//! Bounded retry with optional exponential backoff and jitter.
//!
//! Two callers use this with very different shapes:
//! - the probe runner retries flaky exec attempts immediately, with no delay,
//!   a fixed number of times
//! - the kube provisioner polls for pod IPs with exponential backoff
//!
//! # Example
//!
//! ```ignore
//! use netcheck::retry::{retry_with_backoff, RetryConfig};
//!
//! let connected = retry_with_backoff(
//!     &RetryConfig::immediate(2),
//!     "probe x/a -> y/b 80/TCP",
//!     || executor.execute(&source, dest_ip, 80, Protocol::Tcp),
//! ).await;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first one (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts; zero disables sleeping entirely
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a backoff config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// One initial attempt plus `retries` immediate re-attempts, no delay.
    pub fn immediate(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Create a config that retries forever
    pub fn infinite() -> Self {
        Self::default()
    }
}

/// Execute an async operation until it succeeds or attempts run out.
///
/// Returns the first `Ok`, or the last error once `max_attempts` is
/// exhausted. With a non-zero delay, sleeps between attempts using
/// exponential backoff with 0.5x-1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max attempts"
                    );
                    return Err(e);
                }

                if delay.is_zero() {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed, retrying immediately"
                    );
                    continue;
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
