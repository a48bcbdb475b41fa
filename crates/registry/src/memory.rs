//! In-memory ticket registry.
//!
//! [`MemoryTicketRegistry`] keeps tickets in a [`BTreeMap`] behind a
//! [`parking_lot::RwLock`]. It is the reference backend: single-node
//! deployments and tests use it directly, and its behaviour defines what the
//! conformance suite expects from every other backend.
//!
//! # Performance Characteristics
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | add / fetch / remove | O(log n) |
//! | compare_and_swap | O(log n) plus one ticket comparison |
//! | scan | O(log n + k) where k is the page size |
//!
//! # Limitations
//!
//! - Tickets are lost when the process exits
//! - Not shared between nodes

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use sso_common_tickets::{Result, Ticket, TicketError};

use crate::registry::{ScanConsistency, TicketRegistry};

/// In-memory registry.
///
/// `MemoryTicketRegistry` is cheaply cloneable via [`Arc`]. All clones share
/// the same tickets.
#[derive(Clone, Default)]
pub struct MemoryTicketRegistry {
    tickets: Arc<RwLock<BTreeMap<String, Ticket>>>,
}

impl MemoryTicketRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored tickets, valid or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.read().len()
    }

    /// Returns `true` if no tickets are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryTicketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTicketRegistry").field("tickets", &self.len()).finish()
    }
}

#[async_trait]
impl TicketRegistry for MemoryTicketRegistry {
    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id()))]
    async fn add(&self, ticket: Ticket) -> Result<()> {
        let mut tickets = self.tickets.write();
        if tickets.contains_key(ticket.id()) {
            return Err(TicketError::duplicate(ticket.id()));
        }
        tickets.insert(ticket.id().to_owned(), ticket);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch(&self, id: &str) -> Result<Option<Ticket>> {
        Ok(self.tickets.read().get(id).cloned())
    }

    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id()))]
    async fn update(&self, ticket: Ticket) -> Result<()> {
        let mut tickets = self.tickets.write();
        match tickets.get_mut(ticket.id()) {
            Some(slot) => {
                *slot = ticket;
                Ok(())
            },
            None => Err(TicketError::not_found(ticket.id())),
        }
    }

    #[tracing::instrument(skip(self, expected, new), fields(ticket_id = %expected.id()))]
    async fn compare_and_swap(&self, expected: &Ticket, new: Ticket) -> Result<()> {
        let mut tickets = self.tickets.write();
        match tickets.get_mut(expected.id()) {
            Some(slot) if slot == expected => {
                *slot = new;
                Ok(())
            },
            Some(_) => Err(TicketError::conflict(expected.id())),
            None => Err(TicketError::not_found(expected.id())),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, id: &str) -> Result<Option<Ticket>> {
        Ok(self.tickets.write().remove(id))
    }

    #[tracing::instrument(skip(self))]
    async fn delete_all(&self) -> Result<usize> {
        let mut tickets = self.tickets.write();
        let count = tickets.len();
        tickets.clear();
        Ok(count)
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<Ticket>> {
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let tickets = self.tickets.read();
        Ok(tickets
            .range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, ticket)| ticket.clone())
            .collect())
    }

    fn scan_consistency(&self) -> ScanConsistency {
        ScanConsistency::PerPage
    }

    /// Removes the whole graph under one write lock, so no reader observes a
    /// partially deleted session.
    #[tracing::instrument(skip(self))]
    async fn delete_with_count(&self, id: &str) -> Result<usize> {
        let mut tickets = self.tickets.write();
        let mut pending = vec![id.to_owned()];
        let mut removed = 0;

        while let Some(next) = pending.pop() {
            if let Some(ticket) = tickets.remove(&next) {
                removed += 1;
                pending.extend(ticket.children().iter().map(|c| c.id.clone()));
            }
        }
        Ok(removed)
    }
}
