//! Shared test utilities for ticket registry testing.
//!
//! Ticket builders with fixed ids and policies, registry factories for every
//! backend, and assertion macros over [`Result`](sso_common_tickets::Result).
//! Feature-gated behind `testutil` to keep them out of production builds.
//!
//! ```toml
//! [dev-dependencies]
//! sso-common-registry = { path = "../registry", features = ["testutil"] }
//! ```

use std::{sync::Arc, time::Duration};

use sso_common_tickets::{
    Authentication, ChildTicket, ExpirationPolicy, Service, Ticket, TicketKind,
};

use crate::{
    backend::RegistryBackend,
    cipher::TicketCipher,
    kv::{KvTicketRegistry, MemoryKvStore},
    memory::MemoryTicketRegistry,
    registry::TicketRegistry,
};

/// Principal used by the ticket builders.
pub const TEST_PRINCIPAL: &str = "casuser";

/// Builds a root ticket-granting ticket with a one-hour hard timeout.
#[must_use]
pub fn make_tgt(id: &str) -> Ticket {
    make_tgt_with(id, ExpirationPolicy::hard_timeout(Duration::from_secs(3600)))
}

/// Builds a root ticket-granting ticket with the given policy.
#[must_use]
pub fn make_tgt_with(id: &str, policy: ExpirationPolicy) -> Ticket {
    Ticket::builder()
        .id(id)
        .kind(TicketKind::TicketGranting)
        .authentication(Authentication::for_principal(TEST_PRINCIPAL))
        .expiration_policy(policy)
        .build()
}

/// Builds a single-use service ticket under `parent_id`.
///
/// The ticket is not registered on the parent; pair it with
/// [`child_entry`] and [`TicketRegistry::append_child`].
#[must_use]
pub fn make_st(id: &str, parent_id: &str, service: &str) -> Ticket {
    Ticket::builder()
        .id(id)
        .kind(TicketKind::Service)
        .authentication(Authentication::for_principal(TEST_PRINCIPAL))
        .expiration_policy(ExpirationPolicy::single_use(Duration::from_secs(60)))
        .service(Service::new(service))
        .parent_id(parent_id)
        .build()
}

/// Builds the child entry a parent keeps for `ticket`.
#[must_use]
pub fn child_entry(ticket: &Ticket) -> ChildTicket {
    ChildTicket { id: ticket.id().to_owned(), service: ticket.service().cloned() }
}

/// Stores a session with `services.len()` service tickets linked under it.
///
/// Returns the stored TGT (re-read after linking) and the service tickets.
///
/// # Panics
///
/// Panics if any registry call fails.
pub async fn populated_session<R>(
    registry: &R,
    tgt_id: &str,
    services: &[&str],
) -> (Ticket, Vec<Ticket>)
where
    R: TicketRegistry + ?Sized,
{
    registry.add(make_tgt(tgt_id)).await.expect("add tgt");
    let mut tickets = Vec::with_capacity(services.len());
    for (i, service) in services.iter().enumerate() {
        let st = make_st(&format!("ST-{i}-{tgt_id}"), tgt_id, service);
        registry.append_child(tgt_id, child_entry(&st), false).await.expect("append child");
        registry.add(st.clone()).await.expect("add st");
        tickets.push(st);
    }
    let tgt = registry.fetch(tgt_id).await.expect("fetch tgt").expect("tgt stored");
    (tgt, tickets)
}

/// Creates an in-memory registry.
#[must_use]
pub fn memory_registry() -> Arc<MemoryTicketRegistry> {
    Arc::new(MemoryTicketRegistry::new())
}

/// Creates a key-value registry over a fresh in-memory store.
#[must_use]
pub fn kv_registry() -> Arc<KvTicketRegistry<MemoryKvStore>> {
    Arc::new(KvTicketRegistry::new(MemoryKvStore::new()))
}

/// Creates a key-value registry that encrypts tickets under fresh keys.
///
/// # Panics
///
/// Panics if the keys are rejected.
#[must_use]
pub fn kv_encrypted_registry() -> Arc<KvTicketRegistry<MemoryKvStore>> {
    let cipher = TicketCipher::generate().expect("generated keys are valid");
    Arc::new(KvTicketRegistry::encrypted(MemoryKvStore::new(), cipher))
}

/// Creates one instance of every backend, for suites that run against all.
///
/// # Panics
///
/// Panics if the generated encryption keys are rejected.
#[must_use]
pub fn all_backends() -> Vec<(&'static str, Arc<dyn TicketRegistry>)> {
    let cipher = TicketCipher::generate().expect("generated keys are valid");
    vec![
        ("memory", Arc::new(RegistryBackend::memory()) as Arc<dyn TicketRegistry>),
        ("key_value", Arc::new(RegistryBackend::key_value(Arc::new(MemoryKvStore::new())))),
        (
            "key_value_encrypted",
            Arc::new(RegistryBackend::key_value_encrypted(Arc::new(MemoryKvStore::new()), cipher)),
        ),
    ]
}

/// Assert that a ticket result is [`TicketError::NotFound`](sso_common_tickets::TicketError::NotFound).
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err(sso_common_tickets::TicketError::NotFound { .. })),
            "expected TicketError::NotFound, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err(sso_common_tickets::TicketError::NotFound { .. })),
            "{}: expected TicketError::NotFound, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a ticket result is
/// [`TicketError::AlreadyConsumed`](sso_common_tickets::TicketError::AlreadyConsumed).
#[macro_export]
macro_rules! assert_already_consumed {
    ($result:expr) => {
        assert!(
            matches!($result, Err(sso_common_tickets::TicketError::AlreadyConsumed { .. })),
            "expected TicketError::AlreadyConsumed, got: {:?}",
            $result,
        );
    };
}

/// Assert that a ticket result is [`TicketError::Duplicate`](sso_common_tickets::TicketError::Duplicate).
#[macro_export]
macro_rules! assert_duplicate {
    ($result:expr) => {
        assert!(
            matches!($result, Err(sso_common_tickets::TicketError::Duplicate { .. })),
            "expected TicketError::Duplicate, got: {:?}",
            $result,
        );
    };
}
