//! Ticket kinds and identifier generation.
//!
//! Every ticket id has the shape
//!
//! ```text
//! <PREFIX>-<sequence>-<random>[-<node>]
//! ```
//!
//! where `PREFIX` names the [`TicketKind`], `sequence` is a per-generator
//! counter, `random` is base64url (no padding) over bytes drawn from the
//! thread-local CSPRNG, and `node` is an optional hint naming the issuing
//! node. Uniqueness across a cluster rests on the random part; the sequence
//! and node hint only help operators correlate ids in logs.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of random bytes per id.
pub const DEFAULT_RANDOM_BYTES: usize = 32;

/// Fewest random bytes a generator may be configured with.
pub const MIN_RANDOM_BYTES: usize = 16;

/// The kinds of ticket the subsystem issues.
///
/// Serialized as the id prefix (`"TGT"`, `"ST"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketKind {
    /// Ticket-granting ticket: the root of a login session.
    #[serde(rename = "TGT")]
    TicketGranting,
    /// Single-use ticket for one service.
    #[serde(rename = "ST")]
    Service,
    /// Service ticket issued to a proxying service.
    #[serde(rename = "PT")]
    Proxy,
    /// Granting ticket chained under another granting ticket.
    #[serde(rename = "PGT")]
    ProxyGranting,
    /// OAuth authorization code.
    #[serde(rename = "OC")]
    OAuthCode,
    /// OAuth access token.
    #[serde(rename = "AT")]
    AccessToken,
    /// OAuth refresh token.
    #[serde(rename = "RT")]
    RefreshToken,
}

impl TicketKind {
    /// All kinds, in a stable order.
    pub const ALL: [TicketKind; 7] = [
        TicketKind::TicketGranting,
        TicketKind::Service,
        TicketKind::Proxy,
        TicketKind::ProxyGranting,
        TicketKind::OAuthCode,
        TicketKind::AccessToken,
        TicketKind::RefreshToken,
    ];

    /// Returns the id prefix for this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            TicketKind::TicketGranting => "TGT",
            TicketKind::Service => "ST",
            TicketKind::Proxy => "PT",
            TicketKind::ProxyGranting => "PGT",
            TicketKind::OAuthCode => "OC",
            TicketKind::AccessToken => "AT",
            TicketKind::RefreshToken => "RT",
        }
    }

    /// Parses a kind from its prefix.
    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Parses the kind encoded in a ticket id.
    ///
    /// ```
    /// use sso_common_tickets::TicketKind;
    ///
    /// assert_eq!(TicketKind::from_id("PGT-4-abc"), Some(TicketKind::ProxyGranting));
    /// assert_eq!(TicketKind::from_id("XX-4-abc"), None);
    /// ```
    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        id.split_once('-').and_then(|(prefix, _)| Self::from_prefix(prefix))
    }

    /// Returns `true` for kinds that may have children.
    ///
    /// Refresh tokens count as granting: access tokens minted from a refresh
    /// token are recorded under it so they die with it.
    #[must_use]
    pub const fn is_granting(self) -> bool {
        matches!(
            self,
            TicketKind::TicketGranting | TicketKind::ProxyGranting | TicketKind::RefreshToken
        )
    }

    /// Returns `true` for kinds redeemed exactly once at validation.
    #[must_use]
    pub const fn is_single_use(self) -> bool {
        matches!(self, TicketKind::Service | TicketKind::Proxy | TicketKind::OAuthCode)
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Produces fresh, unguessable ticket ids.
///
/// Implementations must be safe to call concurrently from many tasks and
/// must never return the same id twice within the lifetime of a ticket.
pub trait TicketIdGenerator: Send + Sync + fmt::Debug {
    /// Returns a new id carrying the given prefix.
    fn next_id(&self, prefix: &str) -> String;

    /// Returns a new id for the given ticket kind.
    fn next_for(&self, kind: TicketKind) -> String {
        self.next_id(kind.prefix())
    }
}

/// The default id generator.
///
/// Draws [`DEFAULT_RANDOM_BYTES`] from [`rand::rng`] per id (a
/// cryptographically secure, automatically reseeded generator) and appends an
/// optional node hint.
///
/// ```
/// use sso_common_tickets::{DefaultTicketIdGenerator, TicketIdGenerator};
///
/// let generator = DefaultTicketIdGenerator::builder().node("sso.2").build()?;
/// let id = generator.next_id("ST");
/// assert!(id.starts_with("ST-1-"));
/// assert!(id.ends_with("-sso.2"));
/// # Ok::<(), sso_common_tickets::ConfigError>(())
/// ```
#[derive(Debug)]
pub struct DefaultTicketIdGenerator {
    sequence: AtomicU64,
    random_bytes: usize,
    node: Option<String>,
}

#[bon::bon]
impl DefaultTicketIdGenerator {
    /// Creates a generator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `random_bytes` is below [`MIN_RANDOM_BYTES`]
    /// or the node hint contains characters other than ASCII alphanumerics
    /// and `.`.
    #[builder]
    pub fn new(
        #[builder(into)] node: Option<String>,
        #[builder(default = DEFAULT_RANDOM_BYTES)] random_bytes: usize,
    ) -> Result<Self, ConfigError> {
        if random_bytes < MIN_RANDOM_BYTES {
            return Err(ConfigError::BelowMinimum {
                field: "random_bytes",
                min: MIN_RANDOM_BYTES.to_string(),
                value: random_bytes.to_string(),
            });
        }
        if let Some(node) = &node {
            validate_node_hint(node)?;
        }
        Ok(Self { sequence: AtomicU64::new(0), random_bytes, node })
    }

    /// Returns the configured node hint.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }
}

impl Default for DefaultTicketIdGenerator {
    fn default() -> Self {
        Self { sequence: AtomicU64::new(0), random_bytes: DEFAULT_RANDOM_BYTES, node: None }
    }
}

impl TicketIdGenerator for DefaultTicketIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let mut random = vec![0u8; self.random_bytes];
        rand::rng().fill_bytes(&mut random);
        let random = URL_SAFE_NO_PAD.encode(&random);

        match &self.node {
            Some(node) => format!("{prefix}-{sequence}-{random}-{node}"),
            None => format!("{prefix}-{sequence}-{random}"),
        }
    }
}

fn validate_node_hint(node: &str) -> Result<(), ConfigError> {
    if node.is_empty() {
        return Err(ConfigError::Invalid { field: "node", reason: "must not be empty".into() });
    }
    if let Some(c) = node.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '.')) {
        return Err(ConfigError::Invalid {
            field: "node",
            reason: format!("character {c:?} is not allowed"),
        });
    }
    Ok(())
}
