//! Periodic eviction of expired tickets.
//!
//! A [`RegistryCleaner`] pass runs under a cluster-wide lease so that at most
//! one node sweeps per cycle. A pass has two phases:
//!
//! 1. Expired tickets are evicted in three scans: sessions, then other
//!    granting tickets, then everything else. Expired granting tickets are
//!    handed to the [`LogoutHandler`] and then cascade-deleted. Other expired
//!    tickets are deleted.
//! 2. Orphans (tickets whose parent is gone or expired) are deleted.
//!
//! Scans proceed one registry page at a time and the lease is renewed
//! between pages, so a pass never holds more than a page of tickets.
//!
//! Every registry call is bounded by the configured operation timeout. A
//! transient failure ends the pass; the next cycle retries. Deletes of
//! tickets that are already gone are not failures.
//!
//! [`RegistryCleaner::start`] runs passes on a tokio task until the returned
//! [`CleanerHandle`] is stopped or dropped.

use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sso_common_tickets::{Result, Ticket, TicketError};
use tokio::{select, sync::watch, task::JoinHandle, time::sleep};

use crate::{
    config::CleanerConfig,
    lock::{LocalLock, LockingStrategy},
    registry::TicketRegistry,
};

/// Receives expired granting tickets before they are deleted.
///
/// The logout manager implements this to notify the services of a session
/// the cleaner is about to remove.
#[async_trait]
pub trait LogoutHandler: Send + Sync {
    /// Notifies the services reachable from `ticket`. Returns how many
    /// notifications were sent.
    async fn perform_logout(&self, ticket: &Ticket) -> Result<usize>;
}

/// Why a pass did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The cleaner is disabled by configuration.
    Disabled,
    /// Another holder has the lease.
    LockHeld,
}

/// Outcome of one cleaner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Set when the pass did not run.
    pub skipped: Option<SkipReason>,
    /// Expired tickets found in the first phase.
    pub expired: usize,
    /// Tickets removed, including cascaded descendants.
    pub removed: usize,
    /// Orphaned tickets removed in the second phase.
    pub orphans_removed: usize,
    /// Logout notifications reported by the handler.
    pub logouts: usize,
    /// Non-transient failures that were logged and skipped.
    pub failures: usize,
    /// `true` if the lease was lost during the pass.
    pub lease_lost: bool,
}

impl CleanupReport {
    fn skip(reason: SkipReason) -> Self {
        Self { skipped: Some(reason), ..Self::default() }
    }
}

/// Evicts expired tickets from a registry.
pub struct RegistryCleaner {
    registry: Arc<dyn TicketRegistry>,
    lock: Arc<dyn LockingStrategy>,
    logout_handler: Option<Arc<dyn LogoutHandler>>,
    config: CleanerConfig,
}

#[bon::bon]
impl RegistryCleaner {
    /// Creates a cleaner.
    ///
    /// # Arguments
    ///
    /// * `registry` - Registry to sweep.
    /// * `lock` - Cluster lock; defaults to a process-local lock.
    /// * `logout_handler` - Notified of expired granting tickets.
    /// * `config` - Schedule and limits.
    #[builder]
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        #[builder(default = Arc::new(LocalLock::new()))] lock: Arc<dyn LockingStrategy>,
        logout_handler: Option<Arc<dyn LogoutHandler>>,
        #[builder(default)] config: CleanerConfig,
    ) -> Self {
        Self { registry, lock, logout_handler, config }
    }

    /// Returns the cleaner configuration.
    #[must_use]
    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Runs one pass.
    ///
    /// # Errors
    ///
    /// Returns a transient [`TicketError`] if the backend became unavailable
    /// or a call timed out. Work done before the failure stays done.
    #[tracing::instrument(skip(self))]
    pub async fn clean(&self) -> Result<CleanupReport> {
        if !self.config.enabled() {
            tracing::debug!("registry cleaner disabled, skipping pass");
            return Ok(CleanupReport::skip(SkipReason::Disabled));
        }

        if !self.bounded(self.lock.acquire()).await? {
            tracing::warn!("cleaner lease held elsewhere, skipping pass");
            return Ok(CleanupReport::skip(SkipReason::LockHeld));
        }

        let mut report = CleanupReport::default();
        let result = self.sweep(&mut report).await;

        if let Err(e) = self.bounded(self.lock.release()).await {
            tracing::error!(error = %e, "failed to release cleaner lease");
        }

        result?;
        tracing::debug!(
            expired = report.expired,
            removed = report.removed,
            orphans_removed = report.orphans_removed,
            logouts = report.logouts,
            "registry cleaner pass finished"
        );
        Ok(report)
    }

    async fn sweep(&self, report: &mut CleanupReport) -> Result<()> {
        let mut lease = LeaseKeeper::new(self.config.lease_ttl());
        let now = Utc::now();

        for phase in [Phase::ExpiredRoots, Phase::ExpiredGranting, Phase::Expired] {
            let mut pages = PageCursor::new(self.registry.scan_page_size());
            while let Some(page) = pages.next_page(self).await? {
                for ticket in page.iter().filter(|t| phase.selects(t, now)) {
                    if !lease.keep(self).await? {
                        report.lease_lost = true;
                        return Ok(());
                    }
                    report.expired += 1;
                    self.evict(ticket, report).await?;
                }
                if !lease.keep(self).await? {
                    report.lease_lost = true;
                    return Ok(());
                }
            }
        }

        self.remove_orphans(&mut lease, report).await
    }

    async fn evict(&self, ticket: &Ticket, report: &mut CleanupReport) -> Result<()> {
        if ticket.kind().is_granting()
            && let Some(handler) = &self.logout_handler
        {
            // An earlier cascade in this pass may have removed it already.
            let Some(current) = self.bounded(self.registry.fetch(ticket.id())).await? else {
                return Ok(());
            };
            match handler.perform_logout(&current).await {
                Ok(sent) => report.logouts += sent,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::warn!(ticket_id = ticket.id(), error = %e, "logout failed");
                    report.failures += 1;
                },
            }
        }
        match self.bounded(self.registry.delete_with_count(ticket.id())).await {
            Ok(removed) => report.removed += removed,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::warn!(ticket_id = ticket.id(), error = %e, "failed to delete ticket");
                report.failures += 1;
            },
        }
        Ok(())
    }

    async fn remove_orphans(
        &self,
        lease: &mut LeaseKeeper,
        report: &mut CleanupReport,
    ) -> Result<()> {
        let now = Utc::now();
        let mut pages = PageCursor::new(self.registry.scan_page_size());

        while let Some(page) = pages.next_page(self).await? {
            if !lease.keep(self).await? {
                report.lease_lost = true;
                return Ok(());
            }
            // Parent lookups are cached per page only.
            let mut parent_valid: HashMap<String, bool> = HashMap::new();
            for ticket in &page {
                let Some(parent_id) = ticket.parent_id() else {
                    continue;
                };
                let valid = match parent_valid.get(parent_id) {
                    Some(valid) => *valid,
                    None => {
                        let parent = self.bounded(self.registry.fetch(parent_id)).await?;
                        let valid = parent.is_some_and(|p| !p.is_expired_at(now));
                        parent_valid.insert(parent_id.to_owned(), valid);
                        valid
                    },
                };
                if valid {
                    continue;
                }

                match self.bounded(self.registry.delete_with_count(ticket.id())).await {
                    Ok(0) => {},
                    Ok(removed) => {
                        tracing::debug!(
                            ticket_id = ticket.id(),
                            parent_id,
                            "removed orphaned ticket"
                        );
                        report.orphans_removed += 1;
                        report.removed += removed;
                    },
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            ticket_id = ticket.id(),
                            error = %e,
                            "failed to delete orphan"
                        );
                        report.failures += 1;
                    },
                }
            }
        }
        Ok(())
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.operation_timeout(), operation)
            .await
            .map_err(|_| TicketError::timeout())?
    }

    /// Starts the periodic task.
    ///
    /// The first pass runs after the start delay; later passes run every
    /// repeat interval plus a random jitter. A disabled cleaner starts a
    /// task that exits immediately.
    #[must_use]
    pub fn start(self: Arc<Self>) -> CleanerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        CleanerHandle { shutdown_tx, task }
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<()>) {
        if !self.config.enabled() {
            tracing::info!("registry cleaner disabled");
            return;
        }

        select! {
            _ = sleep(self.config.start_delay()) => {}
            _ = shutdown_rx.changed() => return,
        }

        loop {
            match self.clean().await {
                Ok(report) if report.lease_lost => {
                    tracing::warn!("cleaner lease lost during pass");
                },
                Ok(_) => {},
                Err(e) => tracing::warn!(error = %e, "registry cleaner pass failed"),
            }

            select! {
                _ = sleep(self.next_delay()) => {}
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.jitter().as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 { 0 } else { rand::rng().random_range(0..=jitter_ms) };
        self.config.repeat_interval().saturating_add(Duration::from_millis(jitter))
    }
}

impl std::fmt::Debug for RegistryCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCleaner")
            .field("config", &self.config)
            .field("logout_handler", &self.logout_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// Renews the lease once half its lifetime has passed.
struct LeaseKeeper {
    renewed_at: Instant,
    half_life: Duration,
}

impl LeaseKeeper {
    fn new(ttl: Duration) -> Self {
        Self { renewed_at: Instant::now(), half_life: ttl / 2 }
    }

    async fn keep(&mut self, cleaner: &RegistryCleaner) -> Result<bool> {
        if self.renewed_at.elapsed() < self.half_life {
            return Ok(true);
        }
        let renewed = cleaner.bounded(cleaner.lock.renew()).await?;
        self.renewed_at = Instant::now();
        Ok(renewed)
    }
}

/// Which expired tickets a sweep phase evicts.
///
/// Sessions go first so the logout handler still sees their children.
#[derive(Debug, Clone, Copy)]
enum Phase {
    ExpiredRoots,
    ExpiredGranting,
    Expired,
}

impl Phase {
    fn selects(self, ticket: &Ticket, now: DateTime<Utc>) -> bool {
        if !ticket.is_expired_at(now) {
            return false;
        }
        match self {
            Self::ExpiredRoots => ticket.is_root(),
            Self::ExpiredGranting => !ticket.is_root() && ticket.kind().is_granting(),
            Self::Expired => !ticket.is_root() && !ticket.kind().is_granting(),
        }
    }
}

/// Walks the registry one scan page at a time.
///
/// The cursor is the id of the last ticket seen, so deleting tickets
/// between pages does not disturb it.
struct PageCursor {
    after: Option<String>,
    page_size: usize,
    done: bool,
}

impl PageCursor {
    fn new(page_size: usize) -> Self {
        Self { after: None, page_size: page_size.max(1), done: false }
    }

    async fn next_page(&mut self, cleaner: &RegistryCleaner) -> Result<Option<Vec<Ticket>>> {
        if self.done {
            return Ok(None);
        }
        let page = cleaner
            .bounded(cleaner.registry.scan(self.after.as_deref(), self.page_size))
            .await?;
        self.done = page.len() < self.page_size;
        match page.last() {
            Some(last) => {
                self.after = Some(last.id().to_owned());
                Ok(Some(page))
            },
            None => Ok(None),
        }
    }
}

/// Controls a running cleaner task.
///
/// Dropping the handle stops the task after its current pass.
#[derive(Debug)]
pub struct CleanerHandle {
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl CleanerHandle {
    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(self) {
        // The task may already have exited.
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "registry cleaner task panicked");
        }
    }

    /// Returns `true` once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sso_common_tickets::{Authentication, ExpirationPolicy, TicketKind};

    use super::*;
    use crate::{factory::TicketFactory, memory::MemoryTicketRegistry};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LogoutHandler for CountingHandler {
        async fn perform_logout(&self, ticket: &Ticket) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ticket.children().len())
        }
    }

    fn ticket(
        id: &str,
        kind: TicketKind,
        policy: ExpirationPolicy,
        parent: Option<&str>,
    ) -> Ticket {
        Ticket::builder()
            .id(id)
            .kind(kind)
            .authentication(Authentication::for_principal("alice"))
            .expiration_policy(policy)
            .maybe_parent_id(parent)
            .build()
    }

    #[tokio::test]
    async fn disabled_cleaner_skips() {
        let registry = Arc::new(MemoryTicketRegistry::new());
        let cleaner = RegistryCleaner::builder()
            .registry(registry)
            .config(CleanerConfig::builder().enabled(false).build().unwrap())
            .build();
        let report = cleaner.clean().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Disabled));
    }

    #[tokio::test]
    async fn held_lock_skips_pass() {
        let registry = MemoryTicketRegistry::new();
        registry
            .add(ticket("TGT-1-a", TicketKind::TicketGranting, ExpirationPolicy::Always, None))
            .await
            .unwrap();
        let lock = Arc::new(LocalLock::new());
        assert!(lock.acquire().await.unwrap());

        let cleaner =
            RegistryCleaner::builder().registry(Arc::new(registry.clone())).lock(lock).build();
        let report = cleaner.clean().await.unwrap();

        assert_eq!(report.skipped, Some(SkipReason::LockHeld));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn expired_session_is_logged_out_then_removed() {
        let registry = MemoryTicketRegistry::new();
        let handler = Arc::new(CountingHandler::default());
        let factory = TicketFactory::builder().registry(Arc::new(registry.clone())).build();
        let tgt =
            factory.issue_ticket_granting(Authentication::for_principal("alice")).await.unwrap();
        factory.issue_service(tgt.id(), "https://a", false).await.unwrap();
        factory.issue_service(tgt.id(), "https://b", false).await.unwrap();
        registry.expire(tgt.id()).await.unwrap();

        let live =
            factory.issue_ticket_granting(Authentication::for_principal("bob")).await.unwrap();

        let cleaner = RegistryCleaner::builder()
            .registry(Arc::new(registry.clone()))
            .logout_handler(handler.clone())
            .build();
        let report = cleaner.clean().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.logouts, 2);
        assert_eq!(report.removed, 3);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(live.id()).await.is_ok());
    }

    #[tokio::test]
    async fn orphans_are_removed() {
        let registry = MemoryTicketRegistry::new();
        registry
            .add(ticket("ST-1-a", TicketKind::Service, ExpirationPolicy::Never, Some("TGT-9-gone")))
            .await
            .unwrap();

        let cleaner = RegistryCleaner::builder().registry(Arc::new(registry.clone())).build();
        let report = cleaner.clean().await.unwrap();

        assert_eq!(report.orphans_removed, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn lease_is_released_after_pass() {
        let lock = Arc::new(LocalLock::new());
        let cleaner = RegistryCleaner::builder()
            .registry(Arc::new(MemoryTicketRegistry::new()))
            .lock(lock.clone())
            .build();
        cleaner.clean().await.unwrap();
        assert!(lock.acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn started_task_runs_and_stops() {
        let registry = MemoryTicketRegistry::new();
        registry
            .add(ticket("TGT-1-a", TicketKind::TicketGranting, ExpirationPolicy::Always, None))
            .await
            .unwrap();

        let config = CleanerConfig::builder()
            .start_delay(Duration::from_secs(1))
            .repeat_interval(Duration::from_secs(10))
            .jitter(Duration::ZERO)
            .build()
            .unwrap();
        let cleaner = Arc::new(
            RegistryCleaner::builder()
                .registry(Arc::new(registry.clone()))
                .config(config)
                .build(),
        );
        let handle = cleaner.start();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.is_empty());

        handle.stop().await;
    }

    #[test]
    fn delay_stays_within_jitter() {
        let cleaner = RegistryCleaner::builder()
            .registry(Arc::new(MemoryTicketRegistry::new()))
            .config(
                CleanerConfig::builder()
                    .repeat_interval(Duration::from_secs(10))
                    .jitter(Duration::from_secs(2))
                    .build()
                    .unwrap(),
            )
            .build();
        for _ in 0..100 {
            let delay = cleaner.next_delay();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(12));
        }
    }
}
