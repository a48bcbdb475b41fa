//! The ticket registry contract.
//!
//! A backend implements a small set of storage primitives
//! ([`add`](TicketRegistry::add), [`fetch`](TicketRegistry::fetch),
//! [`compare_and_swap`](TicketRegistry::compare_and_swap),
//! [`remove`](TicketRegistry::remove), [`scan`](TicketRegistry::scan), ...).
//! Validation semantics are provided on top of them and are therefore the same
//! for every backend:
//!
//! - [`get`](TicketRegistry::get) reports `NotFound` for unknown, expired and
//!   orphaned tickets alike.
//! - [`consume`](TicketRegistry::consume),
//!   [`record_use`](TicketRegistry::record_use) and
//!   [`append_child`](TicketRegistry::append_child) are compare-and-swap loops,
//!   so concurrent writers never lose updates and a single-use ticket has
//!   exactly one successful redemption.
//! - [`delete`](TicketRegistry::delete) removes the named ticket first and its
//!   descendants afterwards. Once the root is gone every descendant fails the
//!   lineage check, so the session is invalid before the cascade finishes.
//!
//! # Consistency
//!
//! Single-id operations are immediately consistent on every backend. Bulk
//! scans are not required to be; each backend reports what it guarantees via
//! [`scan_consistency`](TicketRegistry::scan_consistency).

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    StreamExt, TryStreamExt,
    future,
    stream::{self, BoxStream},
};
use sso_common_tickets::{ChildGrant, ChildTicket, Result, Ticket, TicketError, TicketKind};

/// Default number of tickets fetched per [`scan`](TicketRegistry::scan) page.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 256;

/// Attempts made by read-modify-write helpers before giving up with `Conflict`.
pub const MAX_CAS_ATTEMPTS: usize = 64;

/// Longest parent chain followed when checking a ticket's lineage.
pub const MAX_LINEAGE_DEPTH: usize = 16;

/// Filter applied to [`stream`](TicketRegistry::stream).
pub type TicketPredicate<'a> = Box<dyn Fn(&Ticket) -> bool + Send + Sync + 'a>;

/// What a backend guarantees about bulk scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanConsistency {
    /// Each page reflects every write completed before the page was read.
    /// Writes between pages may or may not be seen.
    PerPage,
    /// Pages may miss or repeat tickets written recently.
    Eventual,
}

/// Storage of ticket id to ticket, shared by every node of a deployment.
///
/// All methods take `&self`; implementations are shared across tasks behind
/// an `Arc<dyn TicketRegistry>`.
#[async_trait]
pub trait TicketRegistry: Send + Sync {
    /// Stores a new ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Duplicate`] if a ticket with the same id exists.
    /// The caller regenerates the id and tries again.
    async fn add(&self, ticket: Ticket) -> Result<()>;

    /// Returns the stored ticket without any validity checks.
    ///
    /// Validation code should use [`get`](Self::get).
    async fn fetch(&self, id: &str) -> Result<Option<Ticket>>;

    /// Replaces a stored ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::NotFound`] if no ticket with this id is stored.
    async fn update(&self, ticket: Ticket) -> Result<()>;

    /// Replaces `expected` with `new` only if the stored ticket equals `expected`.
    ///
    /// # Errors
    ///
    /// - [`TicketError::Conflict`] when the stored ticket differs from `expected`.
    /// - [`TicketError::NotFound`] when the ticket is gone.
    async fn compare_and_swap(&self, expected: &Ticket, new: Ticket) -> Result<()>;

    /// Removes a single ticket without cascading and returns it.
    ///
    /// Removing an absent id is not an error.
    async fn remove(&self, id: &str) -> Result<Option<Ticket>>;

    /// Removes every ticket and returns how many were removed.
    async fn delete_all(&self) -> Result<usize>;

    /// Returns up to `limit` tickets stored after the ticket with id `after`,
    /// in the backend's key order.
    ///
    /// Plain backends order by id. Backends that hash ids order by the hash.
    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<Ticket>>;

    /// Reports the consistency of [`scan`](Self::scan).
    fn scan_consistency(&self) -> ScanConsistency;

    /// Page size used by [`stream`](Self::stream).
    fn scan_page_size(&self) -> usize {
        DEFAULT_SCAN_PAGE_SIZE
    }

    /// Returns a valid ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::NotFound`] if the ticket is unknown, expired,
    /// or any ancestor is missing or expired.
    async fn get(&self, id: &str) -> Result<Ticket> {
        let now = Utc::now();
        let ticket = self.fetch(id).await?.ok_or_else(|| TicketError::not_found(id))?;
        if ticket.is_expired_at(now) {
            return Err(TicketError::not_found(id));
        }
        ensure_lineage(self, &ticket, now).await?;
        Ok(ticket)
    }

    /// Returns a valid ticket of the given kind.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus [`TicketError::TypeMismatch`] if the ticket
    /// is valid but of another kind.
    async fn get_of_kind(&self, id: &str, kind: TicketKind) -> Result<Ticket> {
        let ticket = self.get(id).await?;
        if ticket.kind() != kind {
            return Err(TicketError::TypeMismatch {
                id: id.to_owned(),
                expected: kind,
                actual: ticket.kind(),
            });
        }
        Ok(ticket)
    }

    /// Redeems a single-use ticket and returns it in its consumed state.
    ///
    /// Of any number of concurrent calls for the same id, exactly one
    /// succeeds.
    ///
    /// # Errors
    ///
    /// - [`TicketError::AlreadyConsumed`] if the ticket was redeemed before.
    /// - [`TicketError::NotFound`] if the ticket is unknown, expired or orphaned.
    /// - [`TicketError::InvalidRequest`] if the ticket's kind is not single-use.
    #[tracing::instrument(skip(self))]
    async fn consume(&self, id: &str) -> Result<Ticket> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let current = self.fetch(id).await?.ok_or_else(|| TicketError::not_found(id))?;
            if !current.kind().is_single_use() {
                return Err(TicketError::invalid_request(format!(
                    "{} tickets cannot be consumed",
                    current.kind()
                )));
            }
            if current.is_consumed() {
                return Err(TicketError::already_consumed(id));
            }
            if current.is_expired_at(now) {
                return Err(TicketError::not_found(id));
            }
            ensure_lineage(self, &current, now).await?;

            let mut next = current.clone();
            next.consume(now)?;
            match self.compare_and_swap(&current, next.clone()).await {
                Ok(()) => return Ok(next),
                Err(TicketError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TicketError::conflict(id))
    }

    /// Records a use of a multi-use ticket and returns the updated ticket.
    ///
    /// Re-arms sliding expiration.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::NotFound`] if the ticket is not valid.
    #[tracing::instrument(skip(self))]
    async fn record_use(&self, id: &str) -> Result<Ticket> {
        update_valid(self, id, |ticket, now| {
            ticket.record_use(now);
            Ok(())
        })
        .await
    }

    /// Registers `child` on a valid granting ticket.
    ///
    /// # Errors
    ///
    /// - [`TicketError::NotFound`] if the parent is not valid.
    /// - [`TicketError::InvalidParent`] if the parent cannot grant tickets.
    #[tracing::instrument(skip(self, child), fields(child_id = %child.id))]
    async fn append_child(
        &self,
        parent_id: &str,
        child: ChildTicket,
        only_track_most_recent: bool,
    ) -> Result<ChildGrant> {
        let mut grant = None;
        update_valid(self, parent_id, |parent, now| {
            grant = Some(parent.add_child(child.clone(), only_track_most_recent, now)?);
            Ok(())
        })
        .await?;
        grant.ok_or_else(|| TicketError::internal("child grant missing after update"))
    }

    /// Drops `child_id` from the children of `parent_id`.
    ///
    /// Returns `false` if the parent is gone or does not list the child. The
    /// parent's validity is not checked, so an expired session can still be
    /// corrected.
    #[tracing::instrument(skip(self))]
    async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<bool> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.fetch(parent_id).await? else {
                return Ok(false);
            };
            let mut next = current.clone();
            if !next.remove_child(child_id) {
                return Ok(false);
            }
            match self.compare_and_swap(&current, next).await {
                Ok(()) => return Ok(true),
                Err(TicketError::Conflict { .. }) => {
                    tracing::trace!(attempt, parent_id, "compare-and-swap conflict, retrying");
                },
                Err(TicketError::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Err(TicketError::conflict(parent_id))
    }

    /// Marks a valid ticket expired regardless of its policy.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::NotFound`] if the ticket is not valid.
    async fn expire(&self, id: &str) -> Result<Ticket> {
        update_valid(self, id, |ticket, _| {
            ticket.mark_expired();
            Ok(())
        })
        .await
    }

    /// Deletes a ticket and, for granting tickets, all descendants.
    ///
    /// Returns `true` if the named ticket existed. Deleting twice returns
    /// `true` then `false`.
    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.delete_with_count(id).await? > 0)
    }

    /// Deletes a ticket and its descendants and returns how many tickets
    /// were removed.
    ///
    /// The named ticket is removed first. Descendants already purged are
    /// skipped.
    #[tracing::instrument(skip(self))]
    async fn delete_with_count(&self, id: &str) -> Result<usize> {
        let Some(root) = self.remove(id).await? else {
            return Ok(0);
        };

        let mut removed = 1;
        let mut visited = HashSet::from([root.id().to_owned()]);
        let mut pending: Vec<String> = root.children().iter().map(|c| c.id.clone()).collect();

        while let Some(child_id) = pending.pop() {
            if !visited.insert(child_id.clone()) {
                continue;
            }
            if let Some(child) = self.remove(&child_id).await? {
                removed += 1;
                pending.extend(child.children().iter().map(|c| c.id.clone()));
            }
        }

        tracing::debug!(removed, "deleted ticket graph");
        Ok(removed)
    }

    /// Lazily streams stored tickets matching `predicate`, page by page.
    ///
    /// Expired tickets are included; the stream applies no validity checks.
    fn stream<'a>(&'a self, predicate: TicketPredicate<'a>) -> BoxStream<'a, Result<Ticket>> {
        let page_size = self.scan_page_size().max(1);
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok::<_, TicketError>(None);
            };
            let page = self.scan(after.as_deref(), page_size).await?;
            let next = if page.len() < page_size {
                None
            } else {
                page.last().map(|t| Some(t.id().to_owned()))
            };
            Ok(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .try_filter(move |ticket| future::ready(predicate(ticket)))
        .boxed()
    }

    /// Counts stored ticket-granting tickets.
    async fn session_count(&self) -> Result<usize> {
        count_kinds(self, &[TicketKind::TicketGranting]).await
    }

    /// Counts stored service and proxy tickets.
    async fn service_ticket_count(&self) -> Result<usize> {
        count_kinds(self, &[TicketKind::Service, TicketKind::Proxy]).await
    }

    /// Returns the valid ticket-granting tickets of a principal.
    async fn sessions_for_principal(&self, principal_id: &str) -> Result<Vec<Ticket>> {
        let now = Utc::now();
        self.stream(Box::new(move |ticket: &Ticket| {
            ticket.kind() == TicketKind::TicketGranting
                && ticket.principal_id() == principal_id
                && !ticket.is_expired_at(now)
        }))
        .try_collect()
        .await
    }
}

/// Checks that every ancestor of `ticket` exists and is unexpired at `now`.
///
/// # Errors
///
/// Returns [`TicketError::NotFound`] naming `ticket` if the chain is broken,
/// expired, or longer than [`MAX_LINEAGE_DEPTH`].
pub async fn ensure_lineage<R>(registry: &R, ticket: &Ticket, now: DateTime<Utc>) -> Result<()>
where
    R: TicketRegistry + ?Sized,
{
    let mut parent_id = ticket.parent_id().map(str::to_owned);
    let mut depth = 0;

    while let Some(id) = parent_id {
        depth += 1;
        if depth > MAX_LINEAGE_DEPTH {
            return Err(TicketError::not_found(ticket.id()));
        }
        match registry.fetch(&id).await? {
            Some(parent) if !parent.is_expired_at(now) => {
                parent_id = parent.parent_id().map(str::to_owned);
            },
            _ => return Err(TicketError::not_found(ticket.id())),
        }
    }
    Ok(())
}

/// Applies `mutate` to a valid ticket with a compare-and-swap loop.
async fn update_valid<R, F>(registry: &R, id: &str, mut mutate: F) -> Result<Ticket>
where
    R: TicketRegistry + ?Sized,
    F: FnMut(&mut Ticket, DateTime<Utc>) -> Result<()> + Send,
{
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let now = Utc::now();
        let current = registry.fetch(id).await?.ok_or_else(|| TicketError::not_found(id))?;
        if current.is_expired_at(now) {
            return Err(TicketError::not_found(id));
        }
        ensure_lineage(registry, &current, now).await?;

        let mut next = current.clone();
        mutate(&mut next, now)?;
        match registry.compare_and_swap(&current, next.clone()).await {
            Ok(()) => return Ok(next),
            Err(TicketError::Conflict { .. }) => {
                tracing::trace!(attempt, ticket_id = id, "compare-and-swap conflict, retrying");
            },
            Err(e) => return Err(e),
        }
    }
    Err(TicketError::conflict(id))
}

async fn count_kinds<R>(registry: &R, kinds: &'static [TicketKind]) -> Result<usize>
where
    R: TicketRegistry + ?Sized,
{
    registry
        .stream(Box::new(move |ticket: &Ticket| kinds.contains(&ticket.kind())))
        .try_fold(0usize, |count, _| future::ready(Ok(count + 1)))
        .await
}
