//! Error types for logout processing.
//!
//! Dispatch errors never escape a logout: they are retried, logged, and
//! recorded on the request in the [`LogoutReport`](crate::LogoutReport).
//! Only registry failures and signing failures reach the caller.

use std::{sync::Arc, time::Duration};

use sso_common_tickets::TicketError;
use thiserror::Error;

/// Type alias for boxed errors that can be shared across threads.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for logout operations.
pub type Result<T> = std::result::Result<T, LogoutError>;

/// Errors raised while tearing down a session or notifying its services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogoutError {
    /// A notification was not answered within the dispatch timeout.
    #[error("Logout dispatch to {url} timed out after {timeout:?}")]
    DispatchTimeout {
        /// The logout endpoint.
        url: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A notification could not be delivered or was rejected.
    #[error("Logout dispatch to {url} failed: {message}")]
    DispatchFailed {
        /// The logout endpoint.
        url: String,
        /// Description of the failure.
        message: String,
        /// HTTP status, if the service answered.
        status: Option<u16>,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A logout message could not be encoded, signed, or verified.
    #[error("Logout message signing error: {message}")]
    Signing {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The registry failed while reading or deleting the session.
    #[error(transparent)]
    Registry(#[from] TicketError),
}

impl LogoutError {
    /// Creates a `DispatchFailed` error without an HTTP status.
    #[must_use]
    pub fn dispatch_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DispatchFailed {
            url: url.into(),
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Creates a `DispatchFailed` error for a non-success HTTP status.
    #[must_use]
    pub fn rejected(url: impl Into<String>, status: u16) -> Self {
        Self::DispatchFailed {
            url: url.into(),
            message: format!("service answered with status {status}"),
            status: Some(status),
            source: None,
        }
    }

    /// Creates a `Signing` error.
    #[must_use]
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing { message: message.into(), source: None }
    }

    /// Creates a `Signing` error with a source.
    #[must_use]
    pub fn signing_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Signing { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if another attempt may succeed.
    ///
    /// Timeouts, connection failures and 5xx answers are transient. A 4xx
    /// answer means the service rejected the message and will do so again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DispatchTimeout { .. } => true,
            Self::DispatchFailed { status, .. } => status.is_none_or(|s| s >= 500 || s == 429),
            Self::Signing { .. } => false,
            Self::Registry(err) => err.is_transient(),
        }
    }
}

impl From<LogoutError> for TicketError {
    fn from(err: LogoutError) -> Self {
        match err {
            LogoutError::Registry(inner) => inner,
            other => TicketError::internal(other.to_string()),
        }
    }
}
