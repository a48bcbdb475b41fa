//! Configuration for the registry, the ticket factory and the cleaner.
//!
//! All types deserialize with `deny_unknown_fields` and accept humantime
//! durations (`"20s"`, `"2m"`). Loading the document is up to the embedding
//! service.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sso_common_tickets::{ConfigError, TicketPolicyConfig};

/// Default delay before the first cleaner pass.
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(20);

/// Default interval between cleaner passes.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(120);

/// Default random delay added to each interval.
pub const DEFAULT_JITTER: Duration = Duration::from_secs(5);

/// Default lifetime of the cleaner lease.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60 * 60);

/// Default time limit for a single registry call made by background tasks.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Which registry backend to build at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// [`MemoryTicketRegistry`](crate::MemoryTicketRegistry).
    #[default]
    Memory,
    /// [`KvTicketRegistry`](crate::KvTicketRegistry) over a key-value store.
    KeyValue,
}

/// Registry configuration.
///
/// ```
/// use sso_common_registry::{BackendKind, RegistryConfig};
///
/// let config: RegistryConfig = serde_json::from_str(r#"{"backend": "key_value"}"#)?;
/// assert_eq!(config.backend, BackendKind::KeyValue);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Backend to build.
    #[serde(default)]
    #[builder(default)]
    pub backend: BackendKind,

    /// Encrypt tickets at rest. Key-value backend only.
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
}

/// Keys for encrypting tickets at rest, base64url encoded, 32 bytes each.
///
/// See [`TicketCipher`](crate::TicketCipher).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    /// Key for hashing ticket ids into store keys.
    #[builder(into)]
    pub hash_key: String,

    /// Key for sealing ticket values.
    #[builder(into)]
    pub encryption_key: String,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("hash_key", &"[REDACTED]")
            .field("encryption_key", &"[REDACTED]")
            .finish()
    }
}

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

/// Ticket factory configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct FactoryConfig {
    /// Expiration policy per ticket kind.
    #[serde(default)]
    #[builder(default)]
    pub policies: TicketPolicyConfig,

    /// Keep only the newest service ticket per service on a session.
    #[serde(default)]
    #[builder(default)]
    pub only_track_most_recent_session: bool,

    /// Node hint appended to generated ids.
    #[serde(default)]
    #[builder(into)]
    pub node: Option<String>,
}

/// Registry cleaner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanerConfig {
    /// Whether the cleaner runs at all.
    #[serde(default = "default_enabled")]
    pub(crate) enabled: bool,

    /// Delay before the first pass.
    #[serde(with = "humantime_serde", default = "default_start_delay")]
    pub(crate) start_delay: Duration,

    /// Interval between passes.
    #[serde(with = "humantime_serde", default = "default_repeat_interval")]
    pub(crate) repeat_interval: Duration,

    /// Upper bound of the random delay added to each interval.
    #[serde(with = "humantime_serde", default = "default_jitter")]
    pub(crate) jitter: Duration,

    /// Lifetime of the cluster lease.
    #[serde(with = "humantime_serde", default = "default_lease_ttl")]
    pub(crate) lease_ttl: Duration,

    /// Time limit for each registry call during a pass.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub(crate) operation_timeout: Duration,
}

fn default_enabled() -> bool {
    true
}

fn default_start_delay() -> Duration {
    DEFAULT_START_DELAY
}

fn default_repeat_interval() -> Duration {
    DEFAULT_REPEAT_INTERVAL
}

fn default_jitter() -> Duration {
    DEFAULT_JITTER
}

fn default_lease_ttl() -> Duration {
    DEFAULT_LEASE_TTL
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay: DEFAULT_START_DELAY,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
            jitter: DEFAULT_JITTER,
            lease_ttl: DEFAULT_LEASE_TTL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

#[bon::bon]
impl CleanerConfig {
    /// Creates a cleaner configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `repeat_interval`, `lease_ttl` or
    /// `operation_timeout` is zero, or if `lease_ttl` is shorter than
    /// `operation_timeout`.
    #[builder]
    pub fn new(
        #[builder(default = true)] enabled: bool,
        #[builder(default = DEFAULT_START_DELAY)] start_delay: Duration,
        #[builder(default = DEFAULT_REPEAT_INTERVAL)] repeat_interval: Duration,
        #[builder(default = DEFAULT_JITTER)] jitter: Duration,
        #[builder(default = DEFAULT_LEASE_TTL)] lease_ttl: Duration,
        #[builder(default = DEFAULT_OPERATION_TIMEOUT)] operation_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { enabled, start_delay, repeat_interval, jitter, lease_ttl, operation_timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration, for values that came from deserialization.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("repeat_interval", self.repeat_interval),
            ("lease_ttl", self.lease_ttl),
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
        if self.lease_ttl < self.operation_timeout {
            return Err(ConfigError::Invalid {
                field: "lease_ttl",
                reason: "must be at least operation_timeout".into(),
            });
        }
        Ok(())
    }

    /// Returns whether the cleaner runs.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the delay before the first pass.
    #[must_use]
    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    /// Returns the interval between passes.
    #[must_use]
    pub fn repeat_interval(&self) -> Duration {
        self.repeat_interval
    }

    /// Returns the jitter bound.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Returns the lease lifetime.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Returns the per-call time limit.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}
