//! Ticket error types and result alias.
//!
//! Every registry backend, the ticket factory and the cleaner report failures
//! through [`TicketError`]. Backends map their internal errors onto these
//! variants so callers can make the same decision regardless of where the
//! tickets live.
//!
//! # Error Types
//!
//! - [`TicketError::NotFound`] - Ticket is unknown, purged, expired, or orphaned
//! - [`TicketError::AlreadyConsumed`] - Single-use ticket was already redeemed
//! - [`TicketError::Duplicate`] - A ticket with the same id already exists
//! - [`TicketError::Conflict`] - Compare-and-set lost against a concurrent writer
//! - [`TicketError::BackendUnavailable`] - The registry backend could not be reached
//! - [`TicketError::Timeout`] - A registry operation exceeded its time limit
//!
//! # Example
//!
//! ```
//! use sso_common_tickets::{Result, TicketError};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     Err(TicketError::not_found(id))
//! }
//!
//! assert!(matches!(lookup("ST-1-abc"), Err(TicketError::NotFound { .. })));
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::TicketKind;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for ticket operations.
pub type Result<T> = std::result::Result<T, TicketError>;

/// Errors that can occur while issuing, storing, or validating tickets.
///
/// `NotFound` is deliberately coarse: unknown, purged, expired and orphaned
/// tickets all map to it, so a validator never learns which of those applied.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TicketError {
    /// The ticket does not exist or is no longer valid.
    #[error("Ticket not found: {id}")]
    NotFound {
        /// The ticket id that was looked up.
        id: String,
    },

    /// A single-use ticket was redeemed a second time.
    #[error("Ticket already consumed: {id}")]
    AlreadyConsumed {
        /// The ticket id.
        id: String,
    },

    /// A ticket with the same id is already stored.
    ///
    /// Callers regenerate the id and try again.
    #[error("Duplicate ticket id: {id}")]
    Duplicate {
        /// The colliding id.
        id: String,
    },

    /// Optimistic concurrency failure.
    ///
    /// The stored ticket changed between read and write. Read-modify-write
    /// helpers retry internally; this surfaces only from raw compare-and-swap.
    #[error("Concurrent modification of ticket {id}")]
    Conflict {
        /// The ticket id that was contended.
        id: String,
    },

    /// The ticket exists and is valid, but is not of the requested kind.
    #[error("Ticket {id} is a {actual}, expected {expected}")]
    TypeMismatch {
        /// The ticket id.
        id: String,
        /// The kind the caller asked for.
        expected: TicketKind,
        /// The kind actually stored.
        actual: TicketKind,
    },

    /// The authentication carried no principal.
    #[error("Authentication has an empty principal")]
    InvalidPrincipal,

    /// The parent ticket cannot grant children.
    #[error("Ticket {id} cannot grant tickets: {reason}")]
    InvalidParent {
        /// The parent ticket id.
        id: String,
        /// Why the parent was rejected.
        reason: String,
    },

    /// The issuance request is incomplete or inconsistent.
    #[error("Invalid ticket request: {reason}")]
    InvalidRequest {
        /// What is wrong with the request.
        reason: String,
    },

    /// The registry backend could not be reached.
    ///
    /// This is a transient error. Callers treat the ticket as invalid for the
    /// current request and may retry later.
    #[error("Registry backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A ticket could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Catch-all for unexpected backend failures.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A registry operation exceeded its time limit.
    #[error("Operation timeout")]
    Timeout,
}

impl TicketError {
    /// Creates a new `NotFound` error for the given ticket id.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a new `AlreadyConsumed` error.
    #[must_use]
    pub fn already_consumed(id: impl Into<String>) -> Self {
        Self::AlreadyConsumed { id: id.into() }
    }

    /// Creates a new `Duplicate` error.
    #[must_use]
    pub fn duplicate(id: impl Into<String>) -> Self {
        Self::Duplicate { id: id.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Creates a new `InvalidParent` error.
    #[must_use]
    pub fn invalid_parent(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParent { id: id.into(), reason: reason.into() }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest { reason: reason.into() }
    }

    /// Creates a new `BackendUnavailable` error with the given message.
    #[must_use]
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable { message: message.into(), source: None }
    }

    /// Creates a new `BackendUnavailable` error with a message and source error.
    #[must_use]
    pub fn backend_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendUnavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` if retrying the same operation may succeed.
    ///
    /// Only backend reachability problems are transient. Validation outcomes
    /// such as `NotFound` or `AlreadyConsumed` are final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::Timeout)
    }
}

impl From<serde_json::Error> for TicketError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source("ticket JSON encoding failed", err)
    }
}

/// Errors raised while validating configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Smallest accepted value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A field has a value that is not accepted for another reason.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
