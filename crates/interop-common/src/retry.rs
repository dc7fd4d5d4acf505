//! Retry utilities with exponential backoff and jitter.
//!
//! Two entry points:
//! - [`retry_with_backoff`] retries any failure, for transient transport errors.
//! - [`retry_on_conflict`] retries only optimistic-concurrency conflicts. The
//!   operation is expected to re-fetch the object and reapply its change on
//!   every attempt.
//!
//! # Example
//!
//! ```ignore
//! use interop_common::retry::{retry_on_conflict, RetryConfig};
//!
//! retry_on_conflict(&RetryConfig::conflict(), "set_in_progress", || async {
//!     let mut latest = store.get(&key).await?;
//!     latest.set_state(State::InProgress);
//!     store.replace(&latest).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Budget for conflict retries: five quick attempts ten milliseconds apart
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 1.0,
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    // ±10% of the delay
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

fn next_delay(config: &RetryConfig, delay: Duration) -> Duration {
    Duration::from_secs_f64(
        (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
    )
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
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
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let wait = jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;
                delay = next_delay(config, delay);
            }
        }
    }
}

/// Run `operation` until it succeeds or fails with something other than a
/// conflict.
///
/// Non-conflict errors are returned immediately. When the budget is spent
/// the last conflict is returned.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_conflict() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Conflict persisted after max retries"
                    );
                    return Err(e);
                }

                let wait = jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = wait.as_millis(),
                    "Version conflict, re-fetching and retrying"
                );

                tokio::time::sleep(wait).await;
                delay = next_delay(config, delay);
            }
        }
    }
}
