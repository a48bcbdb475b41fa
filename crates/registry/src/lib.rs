//! Ticket registry for single-sign-on services.
//!
//! This crate provides the [`TicketRegistry`] contract every node of a
//! deployment validates tickets through, the backends implementing it, the
//! [`TicketFactory`] that issues tickets, and the [`RegistryCleaner`] that
//! evicts expired ones.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Login, validation and logout endpoints               │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        TicketFactory         │       RegistryCleaner        │
//! │   (ids, policies, parents)   │  (lease lock, logout hook)   │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                     TicketRegistry                          │
//! │   get, consume, record_use, append_child, delete, stream    │
//! ├──────────────────────┬──────────────────────────────────────┤
//! │ MemoryTicketRegistry │     KvTicketRegistry<S: KvStore>     │
//! │                      │   optional TicketCipher at rest      │
//! └──────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use sso_common_registry::{MemoryTicketRegistry, TicketFactory, TicketRegistry};
//! use sso_common_tickets::{Authentication, TicketError};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), TicketError> {
//! let registry = Arc::new(MemoryTicketRegistry::new());
//! let factory = TicketFactory::builder().registry(registry.clone()).build();
//!
//! let tgt = factory.issue_ticket_granting(Authentication::for_principal("alice")).await?;
//! let st = factory.issue_service(tgt.id(), "https://mail.example.com", false).await?;
//!
//! registry.consume(st.id()).await?;
//! assert!(matches!(registry.consume(st.id()).await, Err(TicketError::AlreadyConsumed { .. })));
//!
//! registry.delete(tgt.id()).await?;
//! assert!(matches!(registry.get(st.id()).await, Err(TicketError::NotFound { .. })));
//! # Ok(())
//! # }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Use Case | Scan Consistency |
//! |---------|----------|------------------|
//! | [`MemoryTicketRegistry`] | Single node, tests | Per page |
//! | [`KvTicketRegistry`] | Shared cache or key-value engine | Store-defined |
//!
//! # Implementing a Backend
//!
//! Implement the storage primitives of [`TicketRegistry`] (`add`, `fetch`,
//! `update`, `compare_and_swap`, `remove`, `delete_all`, `scan`) and map
//! backend failures onto [`TicketError`](sso_common_tickets::TicketError).
//! Validation semantics come with the trait. Run the [`conformance`] suite
//! against the new backend.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (ticket builders, registry factories, assertion
//!   macros) and the `conformance` suite.
//! - **`failpoints`**: Compiles the `fail` fail points in [`MemoryKvStore`] for fault-injection
//!   tests.

#![deny(unsafe_code)]

pub mod backend;
pub mod cipher;
pub mod cleaner;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod conformance;
pub mod factory;
pub mod kv;
pub mod lock;
pub mod memory;
pub mod registry;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

pub use backend::RegistryBackend;
pub use cipher::TicketCipher;
pub use cleaner::{CleanerHandle, CleanupReport, LogoutHandler, RegistryCleaner, SkipReason};
pub use config::{BackendKind, CleanerConfig, EncryptionConfig, FactoryConfig, RegistryConfig};
pub use factory::{TicketFactory, TicketRequest};
pub use kv::{KvStore, KvTicketRegistry, MemoryKvStore};
pub use lock::{KvLeaseLock, Lease, LocalLock, LockingStrategy};
pub use memory::MemoryTicketRegistry;
pub use registry::{ScanConsistency, TicketPredicate, TicketRegistry, ensure_lineage};
