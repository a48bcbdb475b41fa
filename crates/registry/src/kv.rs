//! Ticket registry over a byte-level key-value store.
//!
//! Distributed caches and key-value engines share one shape: opaque byte
//! values addressed by key, with an atomic compare-and-set. [`KvStore`]
//! captures that shape and [`KvTicketRegistry`] layers the registry contract
//! on top of it, storing each ticket as JSON under `tickets/{id}`.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      KvTicketRegistry<S>     │  JSON, key layout, optional cipher
//! ├──────────────────────────────┤
//! │           S: KvStore         │  get / compare_and_set / delete / scan
//! ├──────────────┬───────────────┤
//! │ MemoryKvStore│  (deployment) │
//! └──────────────┴───────────────┘
//! ```
//!
//! Compare-and-swap reads the stored value, checks that it decodes to the
//! expected ticket, then sets the new value conditional on those exact
//! bytes. Sealed values carry a random nonce, so the bytes of a ticket are
//! never re-derived from the ticket itself.
//!
//! An optional [`TicketCipher`] encrypts tickets at rest: store keys carry a
//! keyed hash of the ticket id, and values are sealed JSON.

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use parking_lot::RwLock;
use sso_common_tickets::{Result, Ticket, TicketError};

use crate::{
    cipher::TicketCipher,
    registry::{MAX_CAS_ATTEMPTS, ScanConsistency, TicketRegistry},
};

/// Key prefix under which tickets are stored.
pub const TICKET_KEY_PREFIX: &[u8] = b"tickets/";

/// A key-value entry returned by [`KvStore::scan`].
pub type KvEntry = (Vec<u8>, Bytes);

/// Byte-level key-value store with compare-and-set.
///
/// Implementations map their transport failures onto
/// [`TicketError::BackendUnavailable`] or [`TicketError::Timeout`] and their
/// compare-and-set failures onto [`TicketError::Conflict`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored under `key`.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Atomically replaces the value under `key` if it currently equals
    /// `expected`.
    ///
    /// `expected = None` means "only if absent"; `new_value = None` deletes
    /// the key.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Conflict`] if the current value differs.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Option<Vec<u8>>,
    ) -> Result<()>;

    /// Deletes `key` and returns the value it held.
    async fn delete(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Returns up to `limit` entries whose keys start with `prefix` and sort
    /// strictly after `after`, in key order.
    async fn scan(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize)
    -> Result<Vec<KvEntry>>;

    /// Reports the consistency of [`scan`](Self::scan).
    fn scan_consistency(&self) -> ScanConsistency {
        ScanConsistency::Eventual
    }
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Option<Vec<u8>>,
    ) -> Result<()> {
        (**self).compare_and_set(key, expected, new_value).await
    }

    async fn delete(&self, key: &[u8]) -> Result<Option<Bytes>> {
        (**self).delete(key).await
    }

    async fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvEntry>> {
        (**self).scan(prefix, after, limit).await
    }

    fn scan_consistency(&self) -> ScanConsistency {
        (**self).scan_consistency()
    }
}

/// In-memory [`KvStore`].
///
/// Cheaply cloneable; all clones share the same data. Used in tests and as
/// the store behind the cleaner's lease when no shared store is configured.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Bytes>>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvStore").field("entries", &self.data.read().len()).finish()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        fail_point!("kv-get", |_| Err(TicketError::backend_unavailable("kv-get fail point")));
        Ok(self.data.read().get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Option<Vec<u8>>,
    ) -> Result<()> {
        fail_point!("kv-compare-and-set", |_| {
            Err(TicketError::backend_unavailable("kv-compare-and-set fail point"))
        });

        let mut data = self.data.write();
        let current = data.get(key).map(Bytes::as_ref);
        if current != expected {
            return Err(TicketError::conflict(String::from_utf8_lossy(key)));
        }
        match new_value {
            Some(value) => {
                data.insert(key.to_vec(), Bytes::from(value));
            },
            None => {
                data.remove(key);
            },
        }
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.data.write().remove(key))
    }

    async fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KvEntry>> {
        fail_point!("kv-scan", |_| Err(TicketError::backend_unavailable("kv-scan fail point")));

        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(prefix),
        };
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn scan_consistency(&self) -> ScanConsistency {
        ScanConsistency::PerPage
    }
}

/// Ticket registry backed by any [`KvStore`].
///
/// With a [`TicketCipher`] the registry stores tickets under hashed keys
/// with sealed values; see [`encrypted`](Self::encrypted).
#[derive(Debug, Clone)]
pub struct KvTicketRegistry<S> {
    store: S,
    cipher: Option<Arc<TicketCipher>>,
}

impl<S: KvStore> KvTicketRegistry<S> {
    /// Creates a registry over `store` that stores plain JSON.
    pub fn new(store: S) -> Self {
        Self { store, cipher: None }
    }

    /// Creates a registry over `store` that encrypts tickets at rest.
    ///
    /// Keys become `tickets/{hash(id)}` and values are sealed JSON. Every
    /// node sharing the store must use the same keys.
    pub fn encrypted(store: S, cipher: TicketCipher) -> Self {
        Self { store, cipher: Some(Arc::new(cipher)) }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns whether tickets are encrypted at rest.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Returns the store key of a ticket id.
    pub fn key(&self, id: &str) -> Vec<u8> {
        let suffix = match &self.cipher {
            Some(cipher) => cipher.hash_id(id),
            None => id.to_owned(),
        };
        let mut key = Vec::with_capacity(TICKET_KEY_PREFIX.len() + suffix.len());
        key.extend_from_slice(TICKET_KEY_PREFIX);
        key.extend_from_slice(suffix.as_bytes());
        key
    }

    fn encode(&self, key: &[u8], ticket: &Ticket) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(ticket)?;
        match &self.cipher {
            Some(cipher) => cipher.seal(key, &json),
            None => Ok(json),
        }
    }

    fn decode(&self, key: &[u8], bytes: &[u8]) -> Result<Ticket> {
        match &self.cipher {
            Some(cipher) => Ok(serde_json::from_slice(&cipher.open(key, bytes)?)?),
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Returns whether the stored value holds `expected`.
    fn holds(&self, key: &[u8], stored: &[u8], expected: &Ticket) -> Result<bool> {
        let expected = serde_json::to_vec(expected)?;
        match &self.cipher {
            Some(cipher) => Ok(cipher.open(key, stored)? == expected),
            None => Ok(stored == expected.as_slice()),
        }
    }
}

#[async_trait]
impl<S: KvStore> TicketRegistry for KvTicketRegistry<S> {
    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id()))]
    async fn add(&self, ticket: Ticket) -> Result<()> {
        let key = self.key(ticket.id());
        let value = self.encode(&key, &ticket)?;
        match self.store.compare_and_set(&key, None, Some(value)).await {
            Err(TicketError::Conflict { .. }) => Err(TicketError::duplicate(ticket.id())),
            other => other,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(&self, id: &str) -> Result<Option<Ticket>> {
        let key = self.key(id);
        self.store.get(&key).await?.map(|bytes| self.decode(&key, &bytes)).transpose()
    }

    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id()))]
    async fn update(&self, ticket: Ticket) -> Result<()> {
        let key = self.key(ticket.id());
        let value = self.encode(&key, &ticket)?;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current =
                self.store.get(&key).await?.ok_or_else(|| TicketError::not_found(ticket.id()))?;
            match self.store.compare_and_set(&key, Some(&current), Some(value.clone())).await {
                Err(TicketError::Conflict { .. }) => {
                    tracing::trace!(attempt, "update raced a concurrent write, retrying");
                },
                other => return other,
            }
        }
        Err(TicketError::conflict(ticket.id()))
    }

    #[tracing::instrument(skip(self, expected, new), fields(ticket_id = %expected.id()))]
    async fn compare_and_swap(&self, expected: &Ticket, new: Ticket) -> Result<()> {
        let key = self.key(expected.id());
        let Some(current) = self.store.get(&key).await? else {
            return Err(TicketError::not_found(expected.id()));
        };
        if !self.holds(&key, &current, expected)? {
            return Err(TicketError::conflict(expected.id()));
        }
        let value = self.encode(&key, &new)?;
        match self.store.compare_and_set(&key, Some(&current), Some(value)).await {
            Err(TicketError::Conflict { .. }) => {
                if self.store.get(&key).await?.is_none() {
                    Err(TicketError::not_found(expected.id()))
                } else {
                    Err(TicketError::conflict(expected.id()))
                }
            },
            other => other,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, id: &str) -> Result<Option<Ticket>> {
        let key = self.key(id);
        self.store.delete(&key).await?.map(|bytes| self.decode(&key, &bytes)).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn delete_all(&self) -> Result<usize> {
        let mut removed = 0;
        loop {
            let page = self.store.scan(TICKET_KEY_PREFIX, None, self.scan_page_size()).await?;
            if page.is_empty() {
                return Ok(removed);
            }
            for (key, _) in page {
                if self.store.delete(&key).await?.is_some() {
                    removed += 1;
                }
            }
        }
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<Ticket>> {
        let after = after.map(|id| self.key(id));
        self.store
            .scan(TICKET_KEY_PREFIX, after.as_deref(), limit)
            .await?
            .iter()
            .map(|(key, value)| self.decode(key, value))
            .collect()
    }

    fn scan_consistency(&self) -> ScanConsistency {
        self.store.scan_consistency()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use chrono::Utc;
    use sso_common_tickets::{Authentication, ExpirationPolicy, TicketKind};

    use super::*;

    /// Store whose conditional replaces always lose a race.
    #[derive(Default)]
    struct ContendedStore {
        inner: MemoryKvStore,
        replace_attempts: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for ContendedStore {
        async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &[u8],
            expected: Option<&[u8]>,
            new_value: Option<Vec<u8>>,
        ) -> Result<()> {
            if expected.is_some() {
                self.replace_attempts.fetch_add(1, Ordering::SeqCst);
                return Err(TicketError::conflict(String::from_utf8_lossy(key)));
            }
            self.inner.compare_and_set(key, expected, new_value).await
        }

        async fn delete(&self, key: &[u8]) -> Result<Option<Bytes>> {
            self.inner.delete(key).await
        }

        async fn scan(
            &self,
            prefix: &[u8],
            after: Option<&[u8]>,
            limit: usize,
        ) -> Result<Vec<KvEntry>> {
            self.inner.scan(prefix, after, limit).await
        }
    }

    fn tgt(id: &str) -> Ticket {
        Ticket::builder()
            .id(id)
            .kind(TicketKind::TicketGranting)
            .authentication(Authentication::for_principal("alice"))
            .expiration_policy(ExpirationPolicy::hard_timeout(Duration::from_secs(60)))
            .build()
    }

    #[tokio::test]
    async fn store_compare_and_set_semantics() {
        let store = MemoryKvStore::new();
        store.compare_and_set(b"k", None, Some(b"v1".to_vec())).await.unwrap();

        let err = store.compare_and_set(b"k", None, Some(b"v2".to_vec())).await;
        assert!(matches!(err, Err(TicketError::Conflict { .. })));

        store.compare_and_set(b"k", Some(b"v1"), None).await.unwrap();
        assert!(store.get(b"k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_scan_respects_prefix() {
        let store = MemoryKvStore::new();
        for key in ["a/1", "tickets/1", "tickets/2", "u/1"] {
            store.compare_and_set(key.as_bytes(), None, Some(Vec::new())).await.unwrap();
        }
        let keys: Vec<_> = store
            .scan(b"tickets/", None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(keys, ["tickets/1", "tickets/2"]);
    }

    #[tokio::test]
    async fn tickets_are_stored_as_json_under_prefix() {
        let registry = KvTicketRegistry::new(MemoryKvStore::new());
        registry.add(tgt("TGT-1-a")).await.unwrap();

        let raw = registry.store().get(b"tickets/TGT-1-a").await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["id"], "TGT-1-a");
        assert_eq!(value["kind"], "TGT");
    }

    #[tokio::test]
    async fn stale_compare_and_swap_conflicts() {
        let registry = KvTicketRegistry::new(MemoryKvStore::new());
        let original = tgt("TGT-1-a");
        registry.add(original.clone()).await.unwrap();

        let mut first = original.clone();
        first.mark_expired();
        registry.compare_and_swap(&original, first).await.unwrap();

        let err = registry.compare_and_swap(&original, original.clone()).await;
        assert!(matches!(err, Err(TicketError::Conflict { .. })));
    }

    #[tokio::test]
    async fn compare_and_swap_on_missing_ticket_is_not_found() {
        let registry = KvTicketRegistry::new(MemoryKvStore::new());
        let ticket = tgt("TGT-1-a");
        let err = registry.compare_and_swap(&ticket, ticket.clone()).await;
        assert!(matches!(err, Err(TicketError::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_gives_up_under_sustained_contention() {
        let registry = KvTicketRegistry::new(ContendedStore::default());
        registry.add(tgt("TGT-1-a")).await.unwrap();

        let mut expired = tgt("TGT-1-a");
        expired.mark_expired();
        let err = registry.update(expired).await;

        assert!(matches!(err, Err(TicketError::Conflict { .. })));
        assert_eq!(registry.store().replace_attempts.load(Ordering::SeqCst), MAX_CAS_ATTEMPTS);
    }

    #[tokio::test]
    async fn encrypted_store_hides_ids_and_values() {
        let registry =
            KvTicketRegistry::encrypted(MemoryKvStore::new(), TicketCipher::generate().unwrap());
        registry.add(tgt("TGT-1-a")).await.unwrap();

        assert!(registry.store().get(b"tickets/TGT-1-a").await.unwrap().is_none());
        let entries = registry.store().scan(TICKET_KEY_PREFIX, None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let (key, value) = &entries[0];
        assert!(!String::from_utf8_lossy(key).contains("TGT-1-a"));
        assert!(serde_json::from_slice::<serde_json::Value>(value).is_err());
        assert!(!String::from_utf8_lossy(value).contains("alice"));
    }

    #[tokio::test]
    async fn encrypted_tickets_read_back_and_swap() {
        let registry =
            KvTicketRegistry::encrypted(MemoryKvStore::new(), TicketCipher::generate().unwrap());
        let original = tgt("TGT-1-a");
        registry.add(original.clone()).await.unwrap();
        assert_eq!(registry.fetch("TGT-1-a").await.unwrap().unwrap().id(), "TGT-1-a");

        let mut expired = original.clone();
        expired.mark_expired();
        registry.compare_and_swap(&original, expired).await.unwrap();
        assert!(registry.fetch("TGT-1-a").await.unwrap().unwrap().is_expired_at(Utc::now()));

        let err = registry.compare_and_swap(&original, original.clone()).await;
        assert!(matches!(err, Err(TicketError::Conflict { .. })));
        assert!(registry.remove("TGT-1-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn other_keys_cannot_read_the_store() {
        let store = MemoryKvStore::new();
        let writer = KvTicketRegistry::encrypted(store.clone(), TicketCipher::generate().unwrap());
        writer.add(tgt("TGT-1-a")).await.unwrap();

        let reader = KvTicketRegistry::encrypted(store.clone(), TicketCipher::generate().unwrap());
        assert!(reader.fetch("TGT-1-a").await.unwrap().is_none());
        let err = reader.scan(None, 10).await;
        assert!(matches!(err, Err(TicketError::Serialization { .. })));
        assert!(KvTicketRegistry::new(store).scan(None, 10).await.is_err());
    }
}
