#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p sso-common-registry --features failpoints --test failpoint_tests
//! ```
//!
//! Fail points are process-global, so every test holds a `FailScenario`
//! for its whole body.

use std::sync::Arc;

use sso_common_registry::{
    KvTicketRegistry, MemoryKvStore, RegistryCleaner, TicketRegistry,
    testutil::{make_tgt, make_tgt_with, populated_session},
};
use sso_common_tickets::{ExpirationPolicy, TicketError};

fn kv() -> Arc<KvTicketRegistry<MemoryKvStore>> {
    Arc::new(KvTicketRegistry::new(MemoryKvStore::new()))
}

#[tokio::test]
async fn unavailable_store_is_reported_as_transient() {
    let scenario = fail::FailScenario::setup();
    let registry = kv();
    registry.add(make_tgt("TGT-1-fp")).await.expect("add");

    fail::cfg("kv-get", "return").expect("failed to configure fail point");
    let result = registry.get("TGT-1-fp").await;
    fail::remove("kv-get");

    match result {
        Err(e @ TicketError::BackendUnavailable { .. }) => assert!(e.is_transient()),
        other => panic!("expected BackendUnavailable, got {other:?}"),
    }
    registry.get("TGT-1-fp").await.expect("store is reachable again");

    scenario.teardown();
}

#[tokio::test]
async fn failed_consume_leaves_ticket_redeemable() {
    let scenario = fail::FailScenario::setup();
    let registry = kv();
    let (_, sts) = populated_session(registry.as_ref(), "TGT-1-fp-consume", &["https://a"]).await;

    fail::cfg("kv-compare-and-set", "return").expect("failed to configure fail point");
    let result = registry.consume(sts[0].id()).await;
    fail::remove("kv-compare-and-set");

    assert!(matches!(result, Err(TicketError::BackendUnavailable { .. })), "got {result:?}");
    let consumed = registry.consume(sts[0].id()).await.expect("consume after recovery");
    assert!(consumed.is_consumed());

    scenario.teardown();
}

#[tokio::test]
async fn cleaner_pass_ends_on_unavailable_scan_and_recovers() {
    let scenario = fail::FailScenario::setup();
    let registry = kv();
    registry
        .add(make_tgt_with("TGT-1-fp-expired", ExpirationPolicy::Always))
        .await
        .expect("add");
    let cleaner = RegistryCleaner::builder().registry(registry.clone()).build();

    fail::cfg("kv-scan", "return").expect("failed to configure fail point");
    let result = cleaner.clean().await;
    fail::remove("kv-scan");
    assert!(result.is_err_and(|e| e.is_transient()));

    let report = cleaner.clean().await.expect("next pass succeeds");
    assert_eq!(report.removed, 1);

    scenario.teardown();
}
