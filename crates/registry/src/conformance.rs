//! Conformance test suite for [`TicketRegistry`] implementations.
//!
//! Every backend runs the same checks so validation behaves identically no
//! matter where tickets live. Each function uses its own ticket ids, so the
//! whole suite can share one registry instance.
//!
//! ```no_run
//! use sso_common_registry::{MemoryTicketRegistry, conformance};
//!
//! #[tokio::test]
//! async fn consume_is_single_use() {
//!     conformance::consume_is_single_use(&MemoryTicketRegistry::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | `add` / `get` / `update` / `delete` semantics |
//! | Validity | Expired and orphaned tickets are `NotFound` |
//! | Lifecycle | `consume`, `record_use`, `append_child` |
//! | Cascade | Deleting a granting ticket removes its graph |
//! | Bulk | `stream`, counts, `delete_all` |

use std::{sync::Arc, time::Duration};

use futures::TryStreamExt;
use sso_common_tickets::{ExpirationPolicy, Ticket, TicketError, TicketKind};

use crate::{
    assert_already_consumed, assert_duplicate, assert_not_found,
    registry::TicketRegistry,
    testutil::{TEST_PRINCIPAL, child_entry, make_st, make_tgt, make_tgt_with, populated_session},
};

// ============================================================================
// CRUD
// ============================================================================

/// `get` of an unknown id is `NotFound`.
pub async fn get_unknown_is_not_found<R: TicketRegistry + ?Sized>(registry: &R) {
    assert_not_found!(registry.get("TGT-0-unknown").await);
}

/// A stored ticket is returned unchanged.
pub async fn add_then_get_returns_ticket<R: TicketRegistry + ?Sized>(registry: &R) {
    let tgt = make_tgt("TGT-1-crud");
    registry.add(tgt.clone()).await.expect("add");
    let stored = registry.get("TGT-1-crud").await.expect("get");
    assert_eq!(stored, tgt);
}

/// Adding an existing id is `Duplicate` and leaves the stored ticket intact.
pub async fn add_duplicate_is_rejected<R: TicketRegistry + ?Sized>(registry: &R) {
    registry.add(make_tgt("TGT-1-dup")).await.expect("first add");
    let other = make_tgt_with("TGT-1-dup", ExpirationPolicy::Never);
    let result = registry.add(other).await;
    assert_duplicate!(result);

    let stored = registry.fetch("TGT-1-dup").await.expect("fetch").expect("still stored");
    assert_ne!(stored.expiration_policy(), &ExpirationPolicy::Never);
}

/// `update` replaces a stored ticket and rejects unknown ids.
pub async fn update_replaces_and_requires_existing<R: TicketRegistry + ?Sized>(registry: &R) {
    assert_not_found!(registry.update(make_tgt("TGT-1-upd-missing")).await);

    let mut tgt = make_tgt("TGT-1-upd");
    registry.add(tgt.clone()).await.expect("add");
    tgt.mark_expired();
    registry.update(tgt).await.expect("update");

    let stored = registry.fetch("TGT-1-upd").await.expect("fetch").expect("stored");
    assert!(stored.is_marked_expired());
}

/// `compare_and_swap` with a stale expectation is a `Conflict`.
pub async fn stale_compare_and_swap_conflicts<R: TicketRegistry + ?Sized>(registry: &R) {
    let original = make_tgt("TGT-1-cas");
    registry.add(original.clone()).await.expect("add");
    registry.record_use("TGT-1-cas").await.expect("record use");

    let mut next = original.clone();
    next.mark_expired();
    let result = registry.compare_and_swap(&original, next).await;
    assert!(matches!(result, Err(TicketError::Conflict { .. })), "got {result:?}");
}

/// `delete` reports `true` then `false`.
pub async fn delete_is_idempotent<R: TicketRegistry + ?Sized>(registry: &R) {
    registry.add(make_tgt("TGT-1-del")).await.expect("add");
    assert!(registry.delete("TGT-1-del").await.expect("first delete"));
    assert!(!registry.delete("TGT-1-del").await.expect("second delete"));
    assert_not_found!(registry.get("TGT-1-del").await);
}

/// `get_of_kind` reports the stored kind on mismatch.
pub async fn get_of_kind_reports_mismatch<R: TicketRegistry + ?Sized>(registry: &R) {
    registry.add(make_tgt("TGT-1-kind")).await.expect("add");
    let result = registry.get_of_kind("TGT-1-kind", TicketKind::Service).await;
    assert!(
        matches!(
            result,
            Err(TicketError::TypeMismatch {
                expected: TicketKind::Service,
                actual: TicketKind::TicketGranting,
                ..
            })
        ),
        "got {result:?}"
    );
    registry.get_of_kind("TGT-1-kind", TicketKind::TicketGranting).await.expect("matching kind");
}

// ============================================================================
// Validity
// ============================================================================

/// A stored but expired ticket is `NotFound`.
pub async fn expired_ticket_is_not_found<R: TicketRegistry + ?Sized>(registry: &R) {
    registry.add(make_tgt_with("TGT-1-exp", ExpirationPolicy::Always)).await.expect("add");
    assert!(registry.fetch("TGT-1-exp").await.expect("fetch").is_some());
    assert_not_found!(registry.get("TGT-1-exp").await);
}

/// A ticket whose parent is expired is `NotFound`.
pub async fn descendant_of_expired_parent_is_not_found<R: TicketRegistry + ?Sized>(registry: &R) {
    let (_, sts) = populated_session(registry, "TGT-1-orph", &["https://a"]).await;
    registry.expire("TGT-1-orph").await.expect("expire");
    assert_not_found!(registry.get(sts[0].id()).await);
    assert_not_found!(registry.consume(sts[0].id()).await);
}

/// A ticket whose parent is gone is `NotFound`.
pub async fn descendant_of_missing_parent_is_not_found<R: TicketRegistry + ?Sized>(registry: &R) {
    let st = make_st("ST-1-lost", "TGT-1-never-stored", "https://a");
    registry.add(st).await.expect("add");
    assert_not_found!(registry.get("ST-1-lost").await);
}

// ============================================================================
// Lifecycle
// ============================================================================

/// The first `consume` succeeds and the second is `AlreadyConsumed`.
pub async fn consume_is_single_use<R: TicketRegistry + ?Sized>(registry: &R) {
    let (_, sts) = populated_session(registry, "TGT-1-consume", &["https://a"]).await;
    let consumed = registry.consume(sts[0].id()).await.expect("first consume");
    assert!(consumed.is_consumed());
    assert_eq!(consumed.use_count(), 1);
    assert_already_consumed!(registry.consume(sts[0].id()).await);
}

/// Granting tickets are not redeemable; `consume` leaves them untouched.
pub async fn consume_rejects_granting_tickets<R: TicketRegistry + ?Sized>(registry: &R) {
    registry.add(make_tgt("TGT-1-consume-granting")).await.expect("add");
    let result = registry.consume("TGT-1-consume-granting").await;
    assert!(
        matches!(result, Err(TicketError::InvalidRequest { .. })),
        "expected InvalidRequest, got {result:?}"
    );

    let stored = registry.get("TGT-1-consume-granting").await.expect("still valid");
    assert!(!stored.is_consumed());
    assert_eq!(stored.use_count(), 0);
}

/// `record_use` updates counters and timestamps.
pub async fn record_use_updates_counters<R: TicketRegistry + ?Sized>(registry: &R) {
    let tgt = make_tgt_with(
        "TGT-1-use",
        ExpirationPolicy::sliding(Duration::from_secs(60), Duration::from_secs(600)),
    );
    registry.add(tgt.clone()).await.expect("add");

    registry.record_use("TGT-1-use").await.expect("first use");
    let used = registry.record_use("TGT-1-use").await.expect("second use");
    assert_eq!(used.use_count(), 2);
    assert!(used.previous_used_at().is_some());
    assert!(used.last_used_at() >= tgt.last_used_at());
}

/// `append_child` keeps every child and reports the first grant.
pub async fn append_child_tracks_children<R: TicketRegistry + ?Sized>(registry: &R) {
    registry.add(make_tgt("TGT-1-kids")).await.expect("add");
    let a = make_st("ST-1-kids", "TGT-1-kids", "https://a");
    let b = make_st("ST-2-kids", "TGT-1-kids", "https://b");

    let first = registry.append_child("TGT-1-kids", child_entry(&a), false).await.expect("a");
    let second = registry.append_child("TGT-1-kids", child_entry(&b), false).await.expect("b");
    assert!(first.first_grant);
    assert!(!second.first_grant);

    let tgt = registry.fetch("TGT-1-kids").await.expect("fetch").expect("stored");
    let ids: Vec<_> = tgt.children().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["ST-1-kids", "ST-2-kids"]);
}

/// A service ticket cannot parent other tickets.
pub async fn append_child_requires_granting_parent<R: TicketRegistry + ?Sized>(registry: &R) {
    let (_, sts) = populated_session(registry, "TGT-1-nongrant", &["https://a"]).await;
    let child = make_st("ST-9-nongrant", sts[0].id(), "https://b");
    let result = registry.append_child(sts[0].id(), child_entry(&child), false).await;
    assert!(matches!(result, Err(TicketError::InvalidParent { .. })), "got {result:?}");
}

// ============================================================================
// Cascade
// ============================================================================

/// Deleting a session removes every descendant.
pub async fn delete_cascades_to_descendants<R: TicketRegistry + ?Sized>(registry: &R) {
    let (_, sts) =
        populated_session(registry, "TGT-1-cascade", &["https://a", "https://b", "https://c"])
            .await;
    let removed = registry.delete_with_count("TGT-1-cascade").await.expect("delete");
    assert_eq!(removed, 4);
    for st in &sts {
        assert!(registry.fetch(st.id()).await.expect("fetch").is_none());
        assert_not_found!(registry.get(st.id()).await);
    }
}

/// Descendants purged before the cascade are skipped.
pub async fn delete_skips_purged_children<R: TicketRegistry + ?Sized>(registry: &R) {
    let (_, sts) = populated_session(registry, "TGT-1-purged", &["https://a", "https://b"]).await;
    registry.remove(sts[0].id()).await.expect("remove");
    assert_eq!(registry.delete_with_count("TGT-1-purged").await.expect("delete"), 2);
}

// ============================================================================
// Bulk
// ============================================================================

/// `stream` applies its predicate and sees every page.
pub async fn stream_filters_tickets<R: TicketRegistry + ?Sized>(registry: &R) {
    let (_, sts) = populated_session(registry, "TGT-1-stream", &["https://a", "https://b"]).await;
    let found: Vec<_> = registry
        .stream(Box::new(|t: &Ticket| t.parent_id() == Some("TGT-1-stream")))
        .try_collect()
        .await
        .expect("stream");
    let mut ids: Vec<_> = found.iter().map(|t| t.id().to_owned()).collect();
    ids.sort();
    let mut expected: Vec<_> = sts.iter().map(|t| t.id().to_owned()).collect();
    expected.sort();
    assert_eq!(ids, expected);
}

/// Sessions are found by principal.
pub async fn sessions_are_found_by_principal<R: TicketRegistry + ?Sized>(registry: &R) {
    registry.add(make_tgt("TGT-1-principal")).await.expect("add");
    let sessions = registry.sessions_for_principal(TEST_PRINCIPAL).await.expect("sessions");
    assert!(sessions.iter().any(|t| t.id() == "TGT-1-principal"));
    assert!(registry.sessions_for_principal("nobody").await.expect("sessions").is_empty());
}

/// `delete_all` empties the registry and reports the count.
///
/// Run last when sharing a registry.
pub async fn delete_all_empties_registry<R: TicketRegistry + ?Sized>(registry: &R) {
    populated_session(registry, "TGT-1-all", &["https://a"]).await;
    let before = registry.session_count().await.expect("count")
        + registry.service_ticket_count().await.expect("count");
    assert!(before >= 2);

    assert!(registry.delete_all().await.expect("delete all") >= 2);
    assert_eq!(registry.session_count().await.expect("count"), 0);
    assert_eq!(registry.service_ticket_count().await.expect("count"), 0);
}

/// Runs every conformance check against one registry.
pub async fn run_all<R: TicketRegistry + ?Sized>(registry: Arc<R>) {
    let registry = registry.as_ref();

    get_unknown_is_not_found(registry).await;
    add_then_get_returns_ticket(registry).await;
    add_duplicate_is_rejected(registry).await;
    update_replaces_and_requires_existing(registry).await;
    stale_compare_and_swap_conflicts(registry).await;
    delete_is_idempotent(registry).await;
    get_of_kind_reports_mismatch(registry).await;

    expired_ticket_is_not_found(registry).await;
    descendant_of_expired_parent_is_not_found(registry).await;
    descendant_of_missing_parent_is_not_found(registry).await;

    consume_is_single_use(registry).await;
    consume_rejects_granting_tickets(registry).await;
    record_use_updates_counters(registry).await;
    append_child_tracks_children(registry).await;
    append_child_requires_granting_parent(registry).await;

    delete_cascades_to_descendants(registry).await;
    delete_skips_purged_children(registry).await;

    stream_filters_tickets(registry).await;
    sessions_are_found_by_principal(registry).await;
    delete_all_empties_registry(registry).await;
}
