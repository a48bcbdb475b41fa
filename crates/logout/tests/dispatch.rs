//! Logout dispatch integration tests.
//!
//! Services are played by wiremock servers. Covers a slow service timing out
//! while its sibling is notified, retry of transient answers, the bound on
//! concurrent dispatches, logout of expired sessions by the cleaner, and
//! logout of services whose redeemed tickets the cleaner already swept.

#![allow(clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use sso_common_logout::{
    LogoutConfig, LogoutError, LogoutManager, LogoutSender, LogoutSigner, LogoutStatus,
    RetryConfig, StaticServiceRegistry, verify,
};
use sso_common_registry::{
    MemoryTicketRegistry, RegistryCleaner, TicketFactory, TicketRegistry, assert_not_found,
    testutil::{child_entry, make_st, make_tgt_with, populated_session},
};
use sso_common_tickets::{Authentication, ExpirationPolicy};
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .initial_backoff(Duration::from_millis(5))
        .max_backoff(Duration::from_millis(20))
        .build()
        .expect("valid retry config")
}

fn http_manager(
    registry: Arc<dyn TicketRegistry>,
    config: LogoutConfig,
) -> (LogoutManager, Arc<LogoutSigner>) {
    let signer = Arc::new(LogoutSigner::generate());
    let manager = LogoutManager::from_config(
        registry,
        Arc::new(StaticServiceRegistry::default()),
        Arc::clone(&signer),
        config,
    )
    .expect("manager");
    (manager, signer)
}

#[tokio::test]
async fn slow_service_times_out_and_both_tickets_are_gone() {
    let fast = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&fast)
        .await;
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&slow)
        .await;

    let registry = Arc::new(MemoryTicketRegistry::new());
    let fast_service = format!("{}/logout", fast.uri());
    let slow_service = format!("{}/logout", slow.uri());
    let (tgt, sts) = populated_session(
        registry.as_ref(),
        "TGT-1-b",
        &[fast_service.as_str(), slow_service.as_str()],
    )
    .await;

    let config = LogoutConfig::builder()
        .dispatch_timeout(Duration::from_millis(200))
        .retry(RetryConfig::none())
        .build()
        .expect("valid logout config");
    let (manager, _) = http_manager(registry.clone(), config);

    let report = manager.destroy_ticket_granting_ticket(tgt.id()).await.expect("destroy");

    assert_eq!(report.tickets_removed, 3);
    assert_eq!(report.requests.len(), 2);
    let delivered: Vec<_> = report.delivered().map(|r| r.ticket_id.as_str()).collect();
    assert_eq!(delivered, vec![sts[0].id()]);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].ticket_id, sts[1].id());

    for st in &sts {
        assert_not_found!(registry.get(st.id()).await, st.id());
    }
    assert_not_found!(registry.get(tgt.id()).await);
}

#[tokio::test]
async fn transient_answers_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(2)
        .mount(&server)
        .await;

    let registry = Arc::new(MemoryTicketRegistry::new());
    let service = format!("{}/logout", server.uri());
    let (tgt, _) = populated_session(registry.as_ref(), "TGT-1-retry", &[service.as_str()]).await;
    let config = LogoutConfig::builder().retry(fast_retry(3)).build().expect("config");
    let (manager, _) = http_manager(registry, config);

    let report = manager.destroy_ticket_granting_ticket(tgt.id()).await.expect("destroy");

    assert_eq!(report.requests[0].status, LogoutStatus::Delivered { attempts: 3 });
}

#[tokio::test]
async fn rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let registry = Arc::new(MemoryTicketRegistry::new());
    let service = format!("{}/logout", server.uri());
    let (tgt, _) =
        populated_session(registry.as_ref(), "TGT-1-reject", &[service.as_str()]).await;
    let config = LogoutConfig::builder().retry(fast_retry(3)).build().expect("config");
    let (manager, _) = http_manager(registry, config);

    let report = manager.destroy_ticket_granting_ticket(tgt.id()).await.expect("destroy");

    match &report.requests[0].status {
        LogoutStatus::Failed { attempts, reason } => {
            assert_eq!(*attempts, 1);
            assert!(reason.contains("400"), "{reason}");
        },
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn services_receive_a_verifiable_form_post() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let registry = Arc::new(MemoryTicketRegistry::new());
    let service = format!("{}/logout", server.uri());
    let (tgt, sts) = populated_session(registry.as_ref(), "TGT-1-form", &[service.as_str()]).await;
    let (manager, signer) = http_manager(registry, LogoutConfig::default());

    manager.destroy_ticket_granting_ticket(tgt.id()).await.expect("destroy");

    let received = server.received_requests().await.expect("recording enabled");
    assert_eq!(received.len(), 1);
    let body = String::from_utf8(received[0].body.clone()).expect("utf-8 body");
    let payload = url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == "logoutRequest")
        .map(|(_, value)| value.into_owned())
        .expect("logoutRequest field");
    let message = verify(&payload, &signer.verifying_key()).expect("valid signature");
    assert_eq!(message.session_index, sts[0].id());
    assert_eq!(message.service, service);
}

/// Sleeps on every send and records the highest number in flight.
#[derive(Default)]
struct GaugeSender {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    sent: AtomicUsize,
}

#[async_trait]
impl LogoutSender for GaugeSender {
    async fn send(&self, _url: &Url, _payload: &str) -> Result<(), LogoutError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn dispatch_respects_max_concurrency() {
    const SERVICES: usize = 12;
    const MAX_CONCURRENCY: usize = 3;

    let registry = Arc::new(MemoryTicketRegistry::new());
    let services: Vec<String> =
        (0..SERVICES).map(|i| format!("https://app{i}.example.com/logout")).collect();
    let refs: Vec<&str> = services.iter().map(String::as_str).collect();
    let (tgt, _) = populated_session(registry.as_ref(), "TGT-1-pool", &refs).await;

    let sender = Arc::new(GaugeSender::default());
    let manager = LogoutManager::builder()
        .registry(registry)
        .services(Arc::new(StaticServiceRegistry::default()))
        .sender(sender.clone())
        .signer(Arc::new(LogoutSigner::generate()))
        .config(
            LogoutConfig::builder().max_concurrency(MAX_CONCURRENCY).build().expect("config"),
        )
        .build();

    let report = manager.destroy_ticket_granting_ticket(tgt.id()).await.expect("destroy");

    assert_eq!(report.delivered().count(), SERVICES);
    assert_eq!(sender.sent.load(Ordering::SeqCst), SERVICES);
    let peak = sender.peak.load(Ordering::SeqCst);
    assert!(peak <= MAX_CONCURRENCY, "peak concurrency {peak} exceeds {MAX_CONCURRENCY}");
    assert!(peak > 1, "dispatches never overlapped");
}

#[tokio::test]
async fn cleaner_logs_out_expired_sessions_before_removing_them() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let registry: Arc<dyn TicketRegistry> = Arc::new(MemoryTicketRegistry::new());
    let policy = ExpirationPolicy::hard_timeout(Duration::from_millis(50));
    registry.add(make_tgt_with("TGT-1-old", policy)).await.expect("add tgt");
    let st = make_st("ST-1-old", "TGT-1-old", &format!("{}/logout", server.uri()));
    registry.append_child("TGT-1-old", child_entry(&st), false).await.expect("append");
    registry.add(st).await.expect("add st");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (manager, _) = http_manager(Arc::clone(&registry), LogoutConfig::default());
    let cleaner = RegistryCleaner::builder()
        .registry(Arc::clone(&registry))
        .logout_handler(Arc::new(manager))
        .build();

    let report = cleaner.clean().await.expect("clean");

    assert_eq!(report.logouts, 1);
    assert!(registry.fetch("TGT-1-old").await.expect("fetch").is_none());
    assert!(registry.fetch("ST-1-old").await.expect("fetch").is_none());
}

#[tokio::test]
async fn redeemed_service_is_notified_after_the_cleaner_swept_its_ticket() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let registry: Arc<dyn TicketRegistry> = Arc::new(MemoryTicketRegistry::new());
    let factory = TicketFactory::builder().registry(Arc::clone(&registry)).build();
    let tgt = factory
        .issue_ticket_granting(Authentication::for_principal("alice"))
        .await
        .expect("issue tgt");
    let service = format!("{}/app", server.uri());
    let st = factory.issue_service(tgt.id(), service.as_str(), false).await.expect("issue st");
    registry.consume(st.id()).await.expect("validate st");

    let cleaner = RegistryCleaner::builder().registry(Arc::clone(&registry)).build();
    let swept = cleaner.clean().await.expect("clean");
    assert_eq!(swept.removed, 1);
    assert!(registry.fetch(st.id()).await.expect("fetch").is_none());

    let (manager, signer) = http_manager(Arc::clone(&registry), LogoutConfig::default());
    let report = manager.destroy_ticket_granting_ticket(tgt.id()).await.expect("destroy");

    assert_eq!(report.tickets_removed, 1);
    let delivered: Vec<_> = report.delivered().map(|r| r.ticket_id.as_str()).collect();
    assert_eq!(delivered, vec![st.id()]);

    let received = server.received_requests().await.expect("recording enabled");
    let body = String::from_utf8(received[0].body.clone()).expect("utf-8 body");
    let payload = url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == "logoutRequest")
        .map(|(_, value)| value.into_owned())
        .expect("logoutRequest field");
    let message = verify(&payload, &signer.verifying_key()).expect("valid signature");
    assert_eq!(message.session_index, st.id());
}
