//! Logout configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sso_common_tickets::ConfigError;

use crate::retry::RetryConfig;

/// Default number of notifications in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default time limit for one notification attempt.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time limit for each registry call made during a logout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Logout manager configuration.
///
/// ```
/// use std::time::Duration;
///
/// use sso_common_logout::LogoutConfig;
///
/// let config: LogoutConfig = serde_json::from_str(
///     r#"{"max_concurrency": 2, "dispatch_timeout": "1s", "retry": {"max_retries": 0}}"#,
/// )?;
/// assert_eq!(config.max_concurrency(), 2);
/// assert_eq!(config.dispatch_timeout(), Duration::from_secs(1));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogoutConfig {
    /// Whether services are notified at all. Sessions are destroyed either
    /// way.
    #[serde(default = "default_enabled")]
    pub(crate) enabled: bool,

    /// Upper bound on concurrent back-channel notifications.
    #[serde(default = "default_max_concurrency")]
    pub(crate) max_concurrency: usize,

    /// Time limit for one notification attempt.
    #[serde(with = "humantime_serde", default = "default_dispatch_timeout")]
    pub(crate) dispatch_timeout: Duration,

    /// Time limit for each registry call.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub(crate) operation_timeout: Duration,

    /// Retry policy for failed notifications.
    #[serde(default)]
    pub(crate) retry: RetryConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_dispatch_timeout() -> Duration {
    DEFAULT_DISPATCH_TIMEOUT
}

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

impl Default for LogoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

#[bon::bon]
impl LogoutConfig {
    /// Creates a logout configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_concurrency` is zero, a timeout is
    /// zero, or the retry policy is invalid.
    #[builder]
    pub fn new(
        #[builder(default = true)] enabled: bool,
        #[builder(default = DEFAULT_MAX_CONCURRENCY)] max_concurrency: usize,
        #[builder(default = DEFAULT_DISPATCH_TIMEOUT)] dispatch_timeout: Duration,
        #[builder(default = DEFAULT_OPERATION_TIMEOUT)] operation_timeout: Duration,
        #[builder(default)] retry: RetryConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { enabled, max_concurrency, dispatch_timeout, operation_timeout, retry };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration, for values that came from deserialization.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_concurrency",
                min: "1".to_owned(),
                value: "0".to_owned(),
            });
        }
        for (field, value) in [
            ("dispatch_timeout", self.dispatch_timeout),
            ("operation_timeout", self.operation_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::BelowMinimum {
                    field,
                    min: "1ms".to_owned(),
                    value: "0s".to_owned(),
                });
            }
        }
        self.retry.validate()
    }

    /// Returns whether services are notified.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the bound on concurrent notifications.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Returns the time limit for one notification attempt.
    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    /// Returns the time limit for each registry call.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}
