//! Conformance suite for every registry backend.
//!
//! Each check runs against a fresh registry for fine-grained failure
//! reporting; `run_all_*` exercises the full suite on a shared instance to
//! catch interference between checks.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use sso_common_registry::{
    KvTicketRegistry, MemoryKvStore, MemoryTicketRegistry, RegistryBackend, TicketCipher,
    conformance,
};

fn memory() -> MemoryTicketRegistry {
    MemoryTicketRegistry::new()
}

fn kv() -> KvTicketRegistry<MemoryKvStore> {
    KvTicketRegistry::new(MemoryKvStore::new())
}

fn kv_encrypted() -> KvTicketRegistry<MemoryKvStore> {
    let cipher = TicketCipher::generate().expect("generated keys are valid");
    KvTicketRegistry::encrypted(MemoryKvStore::new(), cipher)
}

macro_rules! conformance_tests {
    ($($name:ident),* $(,)?) => {
        mod memory_backend {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    conformance::$name(&memory()).await;
                }
            )*
        }

        mod kv_backend {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    conformance::$name(&kv()).await;
                }
            )*
        }

        mod kv_encrypted_backend {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    conformance::$name(&kv_encrypted()).await;
                }
            )*
        }
    };
}

conformance_tests!(
    get_unknown_is_not_found,
    add_then_get_returns_ticket,
    add_duplicate_is_rejected,
    update_replaces_and_requires_existing,
    stale_compare_and_swap_conflicts,
    delete_is_idempotent,
    get_of_kind_reports_mismatch,
    expired_ticket_is_not_found,
    descendant_of_expired_parent_is_not_found,
    descendant_of_missing_parent_is_not_found,
    consume_is_single_use,
    consume_rejects_granting_tickets,
    record_use_updates_counters,
    append_child_tracks_children,
    append_child_requires_granting_parent,
    delete_cascades_to_descendants,
    delete_skips_purged_children,
    stream_filters_tickets,
    sessions_are_found_by_principal,
    delete_all_empties_registry,
);

#[tokio::test]
async fn run_all_memory() {
    conformance::run_all(Arc::new(memory())).await;
}

#[tokio::test]
async fn run_all_key_value() {
    conformance::run_all(Arc::new(kv())).await;
}

#[tokio::test]
async fn run_all_key_value_encrypted() {
    conformance::run_all(Arc::new(kv_encrypted())).await;
}

#[tokio::test]
async fn run_all_runtime_selected_backend() {
    conformance::run_all(Arc::new(RegistryBackend::memory())).await;
    conformance::run_all(Arc::new(RegistryBackend::key_value(Arc::new(MemoryKvStore::new()))))
        .await;
}
