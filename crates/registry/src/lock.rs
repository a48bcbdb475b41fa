//! Cluster-wide locks for background work.
//!
//! The registry cleaner must run on at most one node per cycle. A
//! [`LockingStrategy`] decides which node that is. Locks are leases: a lease
//! names its holder and an expiry instant, so a holder that crashes without
//! releasing blocks others only until the lease runs out.
//!
//! Locks are not reentrant. A holder that tries to acquire a lease it already
//! holds is refused, exactly like any other node.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sso_common_tickets::{Result, TicketError};

use crate::kv::KvStore;

/// Key prefix under which leases are stored.
pub const LOCK_KEY_PREFIX: &str = "locks/";

/// Mutual exclusion for periodic work across nodes.
#[async_trait]
pub trait LockingStrategy: Send + Sync {
    /// Tries to take the lock. Returns `false` if another holder has it,
    /// including this one.
    async fn acquire(&self) -> Result<bool>;

    /// Extends a lock this holder owns. Returns `false` if the lock was lost.
    async fn renew(&self) -> Result<bool>;

    /// Releases the lock if this holder owns it.
    async fn release(&self) -> Result<()>;
}

/// Process-local lock for single-node deployments.
#[derive(Debug, Default)]
pub struct LocalLock {
    held: AtomicBool,
}

impl LocalLock {
    /// Creates an unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockingStrategy for LocalLock {
    async fn acquire(&self) -> Result<bool> {
        Ok(self.held.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok())
    }

    async fn renew(&self) -> Result<bool> {
        Ok(self.held.load(Ordering::Acquire))
    }

    async fn release(&self) -> Result<()> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

/// Lease record stored in the key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Identity of the holder (`<application>:<node>`).
    pub holder: String,
    /// Instant after which the lease is free.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Lease lock kept in a shared [`KvStore`].
///
/// Acquisition, renewal and release are compare-and-set operations on a
/// single key, so two nodes racing for a free lease cannot both win.
#[derive(Debug)]
pub struct KvLeaseLock<S> {
    store: S,
    key: Vec<u8>,
    holder: String,
    ttl: TimeDelta,
}

#[bon::bon]
impl<S: KvStore> KvLeaseLock<S> {
    /// Creates a lease lock.
    ///
    /// # Arguments
    ///
    /// * `store` - Shared store holding the lease.
    /// * `name` - Lock name; one lease per name.
    /// * `application_id` - Application the holder belongs to.
    /// * `node_id` - Unique identity of this node.
    /// * `ttl` - Lease lifetime from acquisition or last renewal.
    #[builder]
    pub fn new(
        store: S,
        #[builder(into)] name: String,
        #[builder(into)] application_id: String,
        #[builder(into)] node_id: String,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: format!("{LOCK_KEY_PREFIX}{name}").into_bytes(),
            holder: format!("{application_id}:{node_id}"),
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Returns this lock's holder identity.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Returns the stored lease, if any.
    pub async fn current(&self) -> Result<Option<Lease>> {
        Ok(self.read().await?.map(|(lease, _)| lease))
    }

    async fn read(&self) -> Result<Option<(Lease, Vec<u8>)>> {
        match self.store.get(&self.key).await? {
            Some(bytes) => {
                let lease = serde_json::from_slice(&bytes)?;
                Ok(Some((lease, bytes.to_vec())))
            },
            None => Ok(None),
        }
    }

    fn fresh_lease(&self, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let lease = Lease {
            holder: self.holder.clone(),
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        Ok(serde_json::to_vec(&lease)?)
    }
}

#[async_trait]
impl<S: KvStore> LockingStrategy for KvLeaseLock<S> {
    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    async fn acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let current = self.read().await?;
        if let Some((lease, _)) = &current
            && lease.is_live(now)
        {
            tracing::debug!(current_holder = %lease.holder, "lease is held");
            return Ok(false);
        }

        let expected = current.as_ref().map(|(_, bytes)| bytes.as_slice());
        match self.store.compare_and_set(&self.key, expected, Some(self.fresh_lease(now)?)).await {
            Ok(()) => Ok(true),
            Err(TicketError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    async fn renew(&self) -> Result<bool> {
        let now = Utc::now();
        let Some((lease, bytes)) = self.read().await? else {
            return Ok(false);
        };
        if lease.holder != self.holder || !lease.is_live(now) {
            return Ok(false);
        }
        let lease = self.fresh_lease(now)?;
        match self.store.compare_and_set(&self.key, Some(&bytes), Some(lease)).await {
            Ok(()) => Ok(true),
            Err(TicketError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    async fn release(&self) -> Result<()> {
        let Some((lease, bytes)) = self.read().await? else {
            return Ok(());
        };
        if lease.holder != self.holder {
            return Ok(());
        }
        match self.store.compare_and_set(&self.key, Some(&bytes), None).await {
            Ok(()) | Err(TicketError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn lock(store: &MemoryKvStore, node: &str, ttl: Duration) -> KvLeaseLock<MemoryKvStore> {
        KvLeaseLock::builder()
            .store(store.clone())
            .name("cleaner")
            .application_id("sso")
            .node_id(node)
            .ttl(ttl)
            .build()
    }

    #[tokio::test]
    async fn local_lock_is_exclusive_and_not_reentrant() {
        let lock = LocalLock::new();
        assert!(lock.acquire().await.unwrap());
        assert!(!lock.acquire().await.unwrap());
        lock.release().await.unwrap();
        assert!(lock.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn only_one_node_holds_the_lease() {
        let store = MemoryKvStore::new();
        let a = lock(&store, "a", Duration::from_secs(60));
        let b = lock(&store, "b", Duration::from_secs(60));

        assert!(a.acquire().await.unwrap());
        assert!(!b.acquire().await.unwrap());
        assert!(!a.acquire().await.unwrap(), "lease must not be reentrant");

        a.release().await.unwrap();
        assert!(b.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = MemoryKvStore::new();
        let a = lock(&store, "a", Duration::from_millis(20));
        let b = lock(&store, "b", Duration::from_secs(60));

        assert!(a.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(b.acquire().await.unwrap());
        assert!(!a.renew().await.unwrap());

        let lease = b.current().await.unwrap().unwrap();
        assert_eq!(lease.holder, "sso:b");
    }

    #[tokio::test]
    async fn release_by_non_holder_is_ignored() {
        let store = MemoryKvStore::new();
        let a = lock(&store, "a", Duration::from_secs(60));
        let b = lock(&store, "b", Duration::from_secs(60));

        assert!(a.acquire().await.unwrap());
        b.release().await.unwrap();
        assert!(a.renew().await.unwrap());
        assert_eq!(a.current().await.unwrap().unwrap().holder, "sso:a");
    }
}
