//! Integration test verifying that logout entry points produce the expected
//! spans.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sso_common_logout::{
    LogoutError, LogoutManager, LogoutSender, LogoutSigner, StaticServiceRegistry,
};
use sso_common_registry::{MemoryTicketRegistry, testutil::populated_session};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};
use url::Url;

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn collect() -> (Arc<Mutex<Vec<String>>>, tracing::subscriber::DefaultGuard) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let subscriber = tracing_subscriber::registry().with(collector);
    (spans, tracing::subscriber::set_default(subscriber))
}

fn assert_span(spans: &Arc<Mutex<Vec<String>>>, name: &str) {
    let recorded = spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == name), "expected a '{name}' span, got: {recorded:?}");
}

struct AcceptingSender;

#[async_trait]
impl LogoutSender for AcceptingSender {
    async fn send(&self, _url: &Url, _payload: &str) -> Result<(), LogoutError> {
        Ok(())
    }
}

fn manager(registry: Arc<MemoryTicketRegistry>) -> LogoutManager {
    LogoutManager::builder()
        .registry(registry)
        .services(Arc::new(StaticServiceRegistry::default()))
        .sender(Arc::new(AcceptingSender))
        .signer(Arc::new(LogoutSigner::generate()))
        .build()
}

#[tokio::test]
async fn destroy_creates_span_with_dispatch() {
    let (spans, _guard) = collect();

    let registry = Arc::new(MemoryTicketRegistry::new());
    let (tgt, _) =
        populated_session(registry.as_ref(), "TGT-1-span", &["https://a.example.com"]).await;
    manager(registry).destroy_ticket_granting_ticket(tgt.id()).await.expect("destroy");

    assert_span(&spans, "destroy_ticket_granting_ticket");
    assert_span(&spans, "dispatch");
    assert_span(&spans, "with_retry");
    assert_span(&spans, "delete_with_count");
}

#[tokio::test]
async fn notify_session_creates_span() {
    let (spans, _guard) = collect();

    let registry = Arc::new(MemoryTicketRegistry::new());
    let (tgt, _) =
        populated_session(registry.as_ref(), "TGT-2-span", &["https://a.example.com"]).await;
    manager(registry).notify_session(&tgt).await.expect("notify");

    assert_span(&spans, "notify_session");
}

#[tokio::test]
async fn destroy_sessions_for_principal_creates_span() {
    let (spans, _guard) = collect();

    let registry = Arc::new(MemoryTicketRegistry::new());
    let _ = manager(registry).destroy_sessions_for_principal("nobody").await;

    assert_span(&spans, "destroy_sessions_for_principal");
}
