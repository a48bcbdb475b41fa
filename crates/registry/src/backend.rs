//! Registry backend selected at startup.
//!
//! [`RegistryBackend`] wraps every registry implementation in this crate so
//! a service can choose one from configuration and still pass a single
//! concrete type around. Dispatch is a `match`, not a virtual call.
//!
//! | Variant | Use Case |
//! |---------|----------|
//! | [`RegistryBackend::Memory`] | Single node, tests |
//! | [`RegistryBackend::KeyValue`] | Shared distributed cache or key-value engine |
//!
//! ```
//! use std::sync::Arc;
//!
//! use sso_common_registry::{BackendKind, RegistryBackend, RegistryConfig, TicketRegistry};
//!
//! let config = RegistryConfig::builder().backend(BackendKind::KeyValue).build();
//! let registry: Arc<dyn TicketRegistry> = Arc::new(RegistryBackend::from_config(&config)?);
//! # let _ = registry;
//! # Ok::<(), sso_common_tickets::ConfigError>(())
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use sso_common_tickets::{ConfigError, Result, Ticket};

use crate::{
    cipher::TicketCipher,
    config::{BackendKind, RegistryConfig},
    kv::{KvStore, KvTicketRegistry, MemoryKvStore},
    memory::MemoryTicketRegistry,
    registry::{ScanConsistency, TicketRegistry},
};

/// Runtime-selected registry backend.
#[derive(Clone)]
pub enum RegistryBackend {
    /// In-memory map.
    Memory(MemoryTicketRegistry),
    /// Key-value store with compare-and-set.
    KeyValue(KvTicketRegistry<Arc<dyn KvStore>>),
}

impl RegistryBackend {
    /// Builds the backend named by the configuration.
    ///
    /// `KeyValue` is built over an in-memory store. Deployments with a shared
    /// store use [`key_value`](Self::key_value) or
    /// [`key_value_encrypted`](Self::key_value_encrypted) instead.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the encryption keys are malformed
    /// or encryption is requested for the memory backend.
    pub fn from_config(config: &RegistryConfig) -> std::result::Result<Self, ConfigError> {
        let cipher = config.encryption.as_ref().map(TicketCipher::from_config).transpose()?;
        let backend = match (config.backend, cipher) {
            (BackendKind::Memory, None) => Self::memory(),
            (BackendKind::Memory, Some(_)) => {
                return Err(ConfigError::Invalid {
                    field: "encryption",
                    reason: "only the key_value backend stores tickets at rest".into(),
                });
            },
            (BackendKind::KeyValue, None) => Self::key_value(Arc::new(MemoryKvStore::new())),
            (BackendKind::KeyValue, Some(cipher)) => {
                Self::key_value_encrypted(Arc::new(MemoryKvStore::new()), cipher)
            },
        };
        tracing::debug!(backend = ?backend, "registry backend selected");
        Ok(backend)
    }

    /// Creates an in-memory backend.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryTicketRegistry::new())
    }

    /// Creates a backend over a shared key-value store.
    #[must_use]
    pub fn key_value(store: Arc<dyn KvStore>) -> Self {
        Self::KeyValue(KvTicketRegistry::new(store))
    }

    /// Creates a backend over a shared key-value store that encrypts tickets
    /// at rest.
    #[must_use]
    pub fn key_value_encrypted(store: Arc<dyn KvStore>, cipher: TicketCipher) -> Self {
        Self::KeyValue(KvTicketRegistry::encrypted(store, cipher))
    }

    /// Returns the backend kind.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Memory(_) => BackendKind::Memory,
            Self::KeyValue(_) => BackendKind::KeyValue,
        }
    }
}

#[async_trait]
impl TicketRegistry for RegistryBackend {
    async fn add(&self, ticket: Ticket) -> Result<()> {
        match self {
            Self::Memory(r) => r.add(ticket).await,
            Self::KeyValue(r) => r.add(ticket).await,
        }
    }

    async fn fetch(&self, id: &str) -> Result<Option<Ticket>> {
        match self {
            Self::Memory(r) => r.fetch(id).await,
            Self::KeyValue(r) => r.fetch(id).await,
        }
    }

    async fn update(&self, ticket: Ticket) -> Result<()> {
        match self {
            Self::Memory(r) => r.update(ticket).await,
            Self::KeyValue(r) => r.update(ticket).await,
        }
    }

    async fn compare_and_swap(&self, expected: &Ticket, new: Ticket) -> Result<()> {
        match self {
            Self::Memory(r) => r.compare_and_swap(expected, new).await,
            Self::KeyValue(r) => r.compare_and_swap(expected, new).await,
        }
    }

    async fn remove(&self, id: &str) -> Result<Option<Ticket>> {
        match self {
            Self::Memory(r) => r.remove(id).await,
            Self::KeyValue(r) => r.remove(id).await,
        }
    }

    async fn delete_all(&self) -> Result<usize> {
        match self {
            Self::Memory(r) => r.delete_all().await,
            Self::KeyValue(r) => r.delete_all().await,
        }
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<Ticket>> {
        match self {
            Self::Memory(r) => r.scan(after, limit).await,
            Self::KeyValue(r) => r.scan(after, limit).await,
        }
    }

    fn scan_consistency(&self) -> ScanConsistency {
        match self {
            Self::Memory(r) => r.scan_consistency(),
            Self::KeyValue(r) => r.scan_consistency(),
        }
    }

    async fn delete_with_count(&self, id: &str) -> Result<usize> {
        match self {
            Self::Memory(r) => r.delete_with_count(id).await,
            Self::KeyValue(r) => r.delete_with_count(id).await,
        }
    }
}

impl std::fmt::Debug for RegistryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(_) => write!(f, "RegistryBackend::Memory"),
            Self::KeyValue(r) if r.is_encrypted() => {
                write!(f, "RegistryBackend::KeyValue(encrypted)")
            },
            Self::KeyValue(_) => write!(f, "RegistryBackend::KeyValue"),
        }
    }
}
