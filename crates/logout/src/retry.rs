//! Retry of transient dispatch failures.
//!
//! [`with_retry`] re-runs a dispatch while it fails with a transient
//! [`LogoutError`] (timeout, connection failure, 5xx) and the attempt budget
//! lasts. Rejections (4xx) and signing errors return immediately.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0-50% of the computed delay is added

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sso_common_tickets::ConfigError;

use crate::error::{LogoutError, Result};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound of a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Retry policy for logout dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub(crate) max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub(crate) initial_backoff: Duration,

    /// Upper bound of a single delay, before jitter.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub(crate) max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `max_backoff` is shorter than
    /// `initial_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> std::result::Result<Self, ConfigError> {
        let config = Self { max_retries, initial_backoff, max_backoff };
        config.validate()?;
        Ok(config)
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Checks the policy, for values that came from deserialization.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::Invalid {
                field: "max_backoff",
                reason: "must be at least initial_backoff".into(),
            });
        }
        Ok(())
    }

    /// Returns the number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the delay before the first retry.
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the cap on a single delay.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the retry budget
/// is spent.
///
/// Returns the value and the number of attempts made, or the last error with
/// the number of attempts made.
#[tracing::instrument(skip(config, operation), fields(max_retries = config.max_retries))]
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<(T, u32), (LogoutError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "dispatch succeeded after retry",
                    );
                }
                return Ok((value, attempt + 1));
            },
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient dispatch error, retrying after backoff",
                );
                fail_point!("logout-retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => return Err((err, attempt + 1)),
        }
    }
}

/// Computes the backoff delay for the given attempt, with jitter.
fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = capped.as_millis() / 2;
    let jitter_ms = if jitter_range > 0 {
        rand::rng().random_range(0..=u64::try_from(jitter_range).unwrap_or(u64::MAX))
    } else {
        0
    };

    capped + Duration::from_millis(jitter_ms)
}
