//! Session lifecycle under configured expiration policies.
//!
//! Policies are loaded from a configuration document and applied to tickets
//! whose clocks are driven explicitly, so every expiry boundary is exact.

#![allow(clippy::expect_used)]

use chrono::{TimeDelta, Utc};
use sso_common_tickets::{
    Authentication, ChildTicket, DefaultTicketIdGenerator, Service, Ticket, TicketIdGenerator,
    TicketKind, TicketPolicyConfig,
};

const POLICIES: &str = r#"{
    "ticket_granting": {"type": "sliding", "idle_timeout": "30m", "max_lifetime": "8h"},
    "service": {"type": "multi_use", "max_uses": 1, "time_to_live": "10s"},
    "proxy_granting": {"type": "hard_timeout", "max_lifetime": "2h"}
}"#;

fn policies() -> TicketPolicyConfig {
    let config: TicketPolicyConfig = serde_json::from_str(POLICIES).expect("valid policies");
    config.validate().expect("policies pass validation");
    config
}

fn issue(
    generator: &DefaultTicketIdGenerator,
    config: &TicketPolicyConfig,
    kind: TicketKind,
    parent: Option<&Ticket>,
    service: Option<&str>,
) -> Ticket {
    Ticket::builder()
        .id(generator.next_for(kind))
        .kind(kind)
        .authentication(Authentication::for_principal("casuser"))
        .expiration_policy(config.policy_for(kind).clone())
        .maybe_service(service.map(Service::new))
        .maybe_parent_id(parent.map(|p| p.id().to_owned()))
        .build()
}

#[test]
fn session_slides_while_used_and_dies_at_its_ceiling() {
    let config = policies();
    let generator = DefaultTicketIdGenerator::default();
    let mut tgt = issue(&generator, &config, TicketKind::TicketGranting, None, None);
    let start = tgt.created_at();

    // A use every 20 minutes keeps the session alive.
    for step in 1..=23 {
        let now = start + TimeDelta::minutes(20 * step);
        assert!(!tgt.is_expired_at(now), "expired after {} minutes", 20 * step);
        tgt.record_use(now);
    }

    // 8h ceiling passes regardless of use.
    assert!(tgt.is_expired_at(start + TimeDelta::hours(8) + TimeDelta::seconds(1)));
}

#[test]
fn idle_session_expires() {
    let config = policies();
    let generator = DefaultTicketIdGenerator::default();
    let tgt = issue(&generator, &config, TicketKind::TicketGranting, None, None);

    let idle = tgt.created_at() + TimeDelta::minutes(30) + TimeDelta::seconds(1);
    assert!(tgt.is_expired_at(idle));
}

#[test]
fn service_ticket_is_spent_by_one_validation() {
    let config = policies();
    let generator = DefaultTicketIdGenerator::builder().node("sso.1").build().expect("node hint");
    let mut tgt = issue(&generator, &config, TicketKind::TicketGranting, None, None);
    let st = issue(
        &generator,
        &config,
        TicketKind::Service,
        Some(&tgt),
        Some("https://mail.example.com/inbox?lang=en"),
    );

    assert!(st.id().starts_with("ST-") && st.id().ends_with("-sso.1"));
    assert_eq!(TicketKind::from_id(st.id()), Some(TicketKind::Service));

    let now = Utc::now();
    let grant = tgt
        .add_child(
            ChildTicket { id: st.id().to_owned(), service: st.service().cloned() },
            false,
            now,
        )
        .expect("tgt grants service tickets");
    assert!(grant.first_grant);
    assert!(grant.replaced.is_none());
    assert_eq!(tgt.use_count(), 1);

    let mut validated = st.clone();
    validated.consume(now).expect("first validation");
    assert!(validated.is_expired_at(now));
    assert!(validated.consume(now).is_err());

    let unused = st.created_at() + TimeDelta::seconds(11);
    assert!(st.is_expired_at(unused));
}

#[test]
fn ticket_survives_a_json_round_trip_with_its_children() {
    let config = policies();
    let generator = DefaultTicketIdGenerator::default();
    let mut tgt = issue(&generator, &config, TicketKind::TicketGranting, None, None);
    let st = issue(&generator, &config, TicketKind::Service, Some(&tgt), Some("https://a"));
    let pgt = issue(&generator, &config, TicketKind::ProxyGranting, Some(&tgt), Some("https://b"));
    let now = Utc::now();
    for child in [&st, &pgt] {
        tgt.add_child(
            ChildTicket { id: child.id().to_owned(), service: child.service().cloned() },
            false,
            now,
        )
        .expect("add child");
    }

    let json = serde_json::to_string(&tgt).expect("encode");
    let decoded: Ticket = serde_json::from_str(&json).expect("decode");

    assert_eq!(decoded, tgt);
    let children: Vec<_> = decoded.children().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(children, vec![st.id(), pgt.id()]);
    assert_eq!(decoded.expiration_policy(), config.policy_for(TicketKind::TicketGranting));
    assert_eq!(
        decoded.services().map(|(_, s)| s.id()).collect::<Vec<_>>(),
        vec!["https://a", "https://b"]
    );
}
