//! The ticket model.
//!
//! A [`Ticket`] is a plain value. Parents and children refer to each other by
//! id only; the graph is reconstructed through registry lookups. Tickets are
//! serialized as JSON with deterministic field order (all maps are
//! `BTreeMap`), so a byte-level compare-and-set against a previously read
//! encoding is meaningful.
//!
//! Mutations available on a ticket mirror the lifecycle: recording a use,
//! consuming a single-use ticket, registering a child on a granting ticket,
//! and marking a ticket expired. The consumed flag only moves from `false`
//! to `true`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{ExpirationPolicy, Service, TicketError, TicketKind, error::Result};

/// Attribute map shared by principals and authentications.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// The authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Principal {
    /// Stable principal identifier (user name, subject id).
    #[builder(into)]
    pub id: String,
    /// Resolved principal attributes.
    #[serde(default)]
    #[builder(default)]
    pub attributes: Attributes,
}

/// The result of primary authentication, carried read-only by every ticket
/// in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Authentication {
    /// Who authenticated.
    pub principal: Principal,
    /// When authentication completed.
    #[builder(default = Utc::now())]
    pub authenticated_at: DateTime<Utc>,
    /// Authentication metadata (method, handler names, ...).
    #[serde(default)]
    #[builder(default)]
    pub attributes: Attributes,
}

impl Authentication {
    /// Creates an authentication for a principal with no attributes.
    #[must_use]
    pub fn for_principal(principal_id: impl Into<String>) -> Self {
        Self::builder().principal(Principal::builder().id(principal_id).build()).build()
    }

    /// Returns the principal id.
    #[must_use]
    pub fn principal_id(&self) -> &str {
        &self.principal.id
    }
}

/// OAuth grant details carried by codes and tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthGrant {
    /// The registered client the grant was issued to.
    pub client_id: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

/// A child registered on a granting ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTicket {
    /// Id of the child ticket.
    pub id: String,
    /// Service the child was issued for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
}

impl ChildTicket {
    /// Returns the child's kind, parsed from its id.
    #[must_use]
    pub fn kind(&self) -> Option<TicketKind> {
        TicketKind::from_id(&self.id)
    }
}

/// Outcome of registering a child on a granting ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildGrant {
    /// `true` when the child is the first ticket granted by this parent.
    pub first_grant: bool,
    /// Id of a previous child for the same service that was dropped from
    /// the parent's child list.
    pub replaced: Option<String>,
}

/// A ticket of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    id: String,
    kind: TicketKind,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    previous_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    use_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    recent_uses: Vec<DateTime<Utc>>,
    expiration_policy: ExpirationPolicy,
    #[serde(default)]
    expired: bool,
    #[serde(default)]
    consumed: bool,
    authentication: Authentication,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service: Option<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    #[serde(default)]
    from_new_login: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<ChildTicket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oauth: Option<OAuthGrant>,
}

#[bon::bon]
impl Ticket {
    /// Creates a ticket.
    ///
    /// Tickets are normally produced by the ticket factory, which picks the
    /// id and policy; the builder is public for backends and tests.
    #[builder]
    pub fn new(
        #[builder(into)] id: String,
        kind: TicketKind,
        authentication: Authentication,
        expiration_policy: ExpirationPolicy,
        #[builder(default = Utc::now())] created_at: DateTime<Utc>,
        service: Option<Service>,
        #[builder(into)] parent_id: Option<String>,
        #[builder(default)] from_new_login: bool,
        oauth: Option<OAuthGrant>,
    ) -> Self {
        Self {
            id,
            kind,
            created_at,
            last_used_at: created_at,
            previous_used_at: None,
            use_count: 0,
            recent_uses: Vec::new(),
            expiration_policy,
            expired: false,
            consumed: false,
            authentication,
            service,
            parent_id,
            from_new_login,
            children: Vec::new(),
            oauth,
        }
    }
}

impl Ticket {
    /// Returns the ticket id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the ticket kind.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.kind
    }

    /// Returns the creation instant.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the instant of the most recent use, or creation if unused.
    #[must_use]
    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Returns the instant of the use before the most recent one.
    #[must_use]
    pub fn previous_used_at(&self) -> Option<DateTime<Utc>> {
        self.previous_used_at
    }

    /// Returns how many times the ticket was used.
    #[must_use]
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Returns use instants retained for throttling policies.
    #[must_use]
    pub fn recent_uses(&self) -> &[DateTime<Utc>] {
        &self.recent_uses
    }

    /// Returns the policy copied into the ticket at creation.
    #[must_use]
    pub fn expiration_policy(&self) -> &ExpirationPolicy {
        &self.expiration_policy
    }

    /// Returns `true` once a single-use ticket has been redeemed.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Returns `true` if the ticket was explicitly marked expired.
    #[must_use]
    pub fn is_marked_expired(&self) -> bool {
        self.expired
    }

    /// Returns the authentication the session was established with.
    #[must_use]
    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    /// Returns the principal id of the session.
    #[must_use]
    pub fn principal_id(&self) -> &str {
        self.authentication.principal_id()
    }

    /// Returns the service the ticket was issued for.
    #[must_use]
    pub fn service(&self) -> Option<&Service> {
        self.service.as_ref()
    }

    /// Returns the id of the granting ticket.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Returns `true` for a ticket with no parent (a session root).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Returns `true` if the ticket was issued alongside fresh primary authentication.
    #[must_use]
    pub fn from_new_login(&self) -> bool {
        self.from_new_login
    }

    /// Returns the children registered on a granting ticket, oldest first.
    #[must_use]
    pub fn children(&self) -> &[ChildTicket] {
        &self.children
    }

    /// Returns the OAuth grant details, if any.
    #[must_use]
    pub fn oauth(&self) -> Option<&OAuthGrant> {
        self.oauth.as_ref()
    }

    /// Evaluates the explicit expired flag and the expiration policy at `now`.
    ///
    /// This considers the ticket alone. Whether an ancestor is still valid
    /// is answered by the registry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expiration_policy.is_expired(self, now)
    }

    /// Records a successful use at `now`.
    ///
    /// Updates the usage counters and re-arms sliding policies. Use instants
    /// older than the policy's widest throttling window are discarded.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.previous_used_at = Some(self.last_used_at);
        self.last_used_at = now;
        self.use_count = self.use_count.saturating_add(1);

        match self.expiration_policy.use_window().and_then(|w| TimeDelta::from_std(w).ok()) {
            Some(window) => {
                self.recent_uses.retain(|used| now.signed_duration_since(*used) < window);
                self.recent_uses.push(now);
            },
            None => self.recent_uses.clear(),
        }
    }

    /// Redeems a single-use ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::AlreadyConsumed`] if the ticket was redeemed
    /// before. The ticket is left unchanged in that case.
    pub fn consume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.consumed {
            return Err(TicketError::already_consumed(&self.id));
        }
        self.consumed = true;
        self.record_use(now);
        Ok(())
    }

    /// Marks the ticket expired regardless of its policy.
    pub fn mark_expired(&mut self) {
        self.expired = true;
    }

    /// Registers a child on this granting ticket and records a use.
    ///
    /// With `only_track_most_recent`, an existing child whose service
    /// [matches](Service::matches) the new child's service is dropped from
    /// the list and reported in [`ChildGrant::replaced`].
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::InvalidParent`] if this ticket's kind cannot
    /// grant children.
    pub fn add_child(
        &mut self,
        child: ChildTicket,
        only_track_most_recent: bool,
        now: DateTime<Utc>,
    ) -> Result<ChildGrant> {
        if !self.kind.is_granting() {
            return Err(TicketError::invalid_parent(
                &self.id,
                format!("{} tickets cannot grant tickets", self.kind),
            ));
        }

        let first_grant = self.children.is_empty();
        let mut replaced = None;
        if only_track_most_recent
            && let Some(service) = &child.service
            && let Some(pos) = self
                .children
                .iter()
                .position(|c| c.service.as_ref().is_some_and(|s| s.matches(service)))
        {
            replaced = Some(self.children.remove(pos).id);
        }

        self.children.push(child);
        self.record_use(now);
        Ok(ChildGrant { first_grant, replaced })
    }

    /// Removes the most recently added child with this id. Returns `true` if
    /// it was registered.
    pub fn remove_child(&mut self, child_id: &str) -> bool {
        match self.children.iter().rposition(|c| c.id == child_id) {
            Some(pos) => {
                self.children.remove(pos);
                true
            },
            None => false,
        }
    }

    /// Returns the children that carry a service, oldest first.
    pub fn services(&self) -> impl Iterator<Item = (&str, &Service)> {
        self.children.iter().filter_map(|c| c.service.as_ref().map(|s| (c.id.as_str(), s)))
    }
}
