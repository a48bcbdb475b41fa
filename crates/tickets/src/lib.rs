//! Ticket model for single-sign-on sessions.
//!
//! This crate holds the pure, I/O-free part of the ticket subsystem: the
//! [`Ticket`] value, [`TicketKind`]s and their id prefixes, id generation,
//! and [`ExpirationPolicy`] evaluation. Storage, issuance and logout live in
//! `sso-common-registry` and `sso-common-logout`.
//!
//! # Ticket Graph
//!
//! ```text
//!              TGT-1-...            (root, no parent)
//!            /     |      \
//!      ST-2-...  ST-3-...  PGT-4-... (granting, chained)
//!                              |
//!                           PT-5-...
//! ```
//!
//! Links are ids, never references. A child is valid only while every
//! ancestor exists and is unexpired; the registry enforces that on lookup.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use chrono::Utc;
//! use sso_common_tickets::{Authentication, ExpirationPolicy, Ticket, TicketKind};
//!
//! let mut ticket = Ticket::builder()
//!     .id("ST-1-example")
//!     .kind(TicketKind::Service)
//!     .authentication(Authentication::for_principal("alice"))
//!     .expiration_policy(ExpirationPolicy::single_use(Duration::from_secs(10)))
//!     .build();
//!
//! let now = Utc::now();
//! assert!(!ticket.is_expired_at(now));
//! ticket.consume(now)?;
//! assert!(ticket.is_expired_at(now));
//! # Ok::<(), sso_common_tickets::TicketError>(())
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod expiration;
pub mod id;
pub mod service;
pub mod ticket;

pub use config::TicketPolicyConfig;
pub use error::{BoxError, ConfigError, Result, TicketError};
pub use expiration::ExpirationPolicy;
pub use id::{DefaultTicketIdGenerator, TicketIdGenerator, TicketKind};
pub use service::Service;
pub use ticket::{
    Attributes, Authentication, ChildGrant, ChildTicket, OAuthGrant, Principal, Ticket,
};
