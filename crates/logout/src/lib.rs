//! Single-sign-on logout.
//!
//! Ending a session removes its ticket-granting ticket and every descendant
//! from the registry and tells each service that received a ticket from it.
//! Notifications are signed [`LogoutMessage`]s, posted on the back channel by
//! a bounded worker pool or handed back as front-channel redirect URLs.
//!
//! ```text
//! destroy(TGT)
//!    │
//!    ├── walk children by id ──► LogoutServiceRegistry ──► LogoutSigner
//!    ├── delete_with_count(TGT)
//!    └── dispatch ──► Semaphore(max_concurrency) ──► LogoutSender (retry, timeout)
//! ```
//!
//! [`LogoutManager`] also implements the registry cleaner's
//! [`LogoutHandler`](sso_common_registry::LogoutHandler), so expired sessions
//! are announced before the cleaner removes them.
//!
//! # Feature Flags
//!
//! - **`failpoints`**: Compiles the `logout-dispatch` and `logout-retry-before-sleep` fail points.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod manager;
pub mod message;
mod retry;
pub mod sender;
pub mod service;

pub use config::LogoutConfig;
pub use error::{BoxError, LogoutError, Result};
pub use manager::{LogoutManager, LogoutReport, LogoutRequest, LogoutStatus};
pub use message::{LogoutMessage, LogoutSigner, verify, verifying_key_from_base64};
pub use retry::RetryConfig;
pub use sender::{HttpLogoutSender, LOGOUT_REQUEST_PARAM, LogoutSender};
pub use service::{
    LogoutEndpoint, LogoutMode, LogoutServiceRegistry, RegisteredService, StaticServiceRegistry,
};
