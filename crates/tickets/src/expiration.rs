//! Expiration policies.
//!
//! A policy is a pure predicate over a ticket's timestamps and usage
//! counters. It never performs I/O and never reads the clock: callers pass
//! `now` explicitly, which keeps evaluation deterministic on every node.
//!
//! | Policy | Expired when |
//! |--------|--------------|
//! | [`Never`](ExpirationPolicy::Never) | never |
//! | [`Always`](ExpirationPolicy::Always) | always |
//! | [`HardTimeout`](ExpirationPolicy::HardTimeout) | `now > created_at + max_lifetime` |
//! | [`Sliding`](ExpirationPolicy::Sliding) | idle longer than `idle_timeout`, or past `created_at + max_lifetime` |
//! | [`MultiUse`](ExpirationPolicy::MultiUse) | `use_count >= max_uses`, or past `created_at + time_to_live` |
//! | [`ThrottledUse`](ExpirationPolicy::ThrottledUse) | `max_uses` uses inside the trailing `window`, or past `created_at + time_to_live` |
//! | [`Any`](ExpirationPolicy::Any) | any member policy says expired |
//!
//! A ticket that was explicitly marked expired is expired regardless of its
//! policy; see [`Ticket::is_expired_at`].

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Ticket, error::ConfigError};

/// Decides when a ticket stops being valid.
///
/// Policies are plain values: they serialize with the ticket and are copied
/// from configuration into each ticket at creation.
///
/// # Configuration Format
///
/// ```
/// use sso_common_tickets::ExpirationPolicy;
///
/// let policy: ExpirationPolicy = serde_json::from_str(
///     r#"{"type": "sliding", "idle_timeout": "2h", "max_lifetime": "8h"}"#,
/// )?;
/// assert!(matches!(policy, ExpirationPolicy::Sliding { .. }));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    /// The ticket never expires.
    Never,

    /// The ticket is expired as soon as it is created.
    Always,

    /// Fixed lifetime from creation.
    HardTimeout {
        /// Lifetime measured from `created_at`.
        #[serde(with = "humantime_serde")]
        max_lifetime: Duration,
    },

    /// Idle timeout re-armed by every use, capped by a hard lifetime.
    Sliding {
        /// Longest permitted gap since the last use.
        #[serde(with = "humantime_serde")]
        idle_timeout: Duration,
        /// Lifetime ceiling measured from `created_at`.
        #[serde(with = "humantime_serde")]
        max_lifetime: Duration,
    },

    /// A bounded number of uses within a time-to-live.
    ///
    /// `max_uses = 1` is the single-use policy of service tickets.
    MultiUse {
        /// Number of uses after which the ticket is expired.
        max_uses: u32,
        /// Lifetime measured from `created_at`.
        #[serde(with = "humantime_serde")]
        time_to_live: Duration,
    },

    /// A rate limit on uses within a trailing window, plus a time-to-live.
    ThrottledUse {
        /// Uses allowed inside any `window`.
        max_uses: u32,
        /// Width of the trailing window.
        #[serde(with = "humantime_serde")]
        window: Duration,
        /// Lifetime measured from `created_at`.
        #[serde(with = "humantime_serde")]
        time_to_live: Duration,
    },

    /// Expired when any member policy says expired.
    Any {
        /// Member policies.
        policies: Vec<ExpirationPolicy>,
    },
}

impl ExpirationPolicy {
    /// A hard timeout policy.
    #[must_use]
    pub fn hard_timeout(max_lifetime: Duration) -> Self {
        Self::HardTimeout { max_lifetime }
    }

    /// A sliding idle-timeout policy with a hard ceiling.
    #[must_use]
    pub fn sliding(idle_timeout: Duration, max_lifetime: Duration) -> Self {
        Self::Sliding { idle_timeout, max_lifetime }
    }

    /// A single-use policy with a time-to-live.
    #[must_use]
    pub fn single_use(time_to_live: Duration) -> Self {
        Self::MultiUse { max_uses: 1, time_to_live }
    }

    /// A bounded-use policy with a time-to-live.
    #[must_use]
    pub fn multi_use(max_uses: u32, time_to_live: Duration) -> Self {
        Self::MultiUse { max_uses, time_to_live }
    }

    /// A throttled-use policy.
    #[must_use]
    pub fn throttled(max_uses: u32, window: Duration, time_to_live: Duration) -> Self {
        Self::ThrottledUse { max_uses, window, time_to_live }
    }

    /// A composite policy that expires when any member does.
    #[must_use]
    pub fn any(policies: impl IntoIterator<Item = ExpirationPolicy>) -> Self {
        Self::Any { policies: policies.into_iter().collect() }
    }

    /// Evaluates the policy against the ticket's state at `now`.
    #[must_use]
    pub fn is_expired(&self, ticket: &Ticket, now: DateTime<Utc>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::HardTimeout { max_lifetime } => {
                past_deadline(ticket.created_at(), *max_lifetime, now)
            },
            Self::Sliding { idle_timeout, max_lifetime } => {
                past_deadline(ticket.created_at(), *max_lifetime, now)
                    || past_deadline(ticket.last_used_at(), *idle_timeout, now)
            },
            Self::MultiUse { max_uses, time_to_live } => {
                ticket.use_count() >= *max_uses
                    || past_deadline(ticket.created_at(), *time_to_live, now)
            },
            Self::ThrottledUse { max_uses, window, time_to_live } => {
                let in_window = ticket
                    .recent_uses()
                    .iter()
                    .filter(|used| !past_deadline(**used, *window, now))
                    .count();
                in_window >= *max_uses as usize
                    || past_deadline(ticket.created_at(), *time_to_live, now)
            },
            Self::Any { policies } => policies.iter().any(|p| p.is_expired(ticket, now)),
        }
    }

    /// Returns the widest throttling window in this policy, if any.
    ///
    /// Tickets keep use timestamps only as far back as this window.
    #[must_use]
    pub fn use_window(&self) -> Option<Duration> {
        match self {
            Self::ThrottledUse { window, .. } => Some(*window),
            Self::Any { policies } => policies.iter().filter_map(Self::use_window).max(),
            _ => None,
        }
    }

    /// Checks that every parameter is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for zero durations or zero use
    /// counts, and [`ConfigError::Invalid`] for an empty composite or a
    /// sliding policy whose idle timeout exceeds its lifetime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Never | Self::Always => Ok(()),
            Self::HardTimeout { max_lifetime } => non_zero("max_lifetime", *max_lifetime),
            Self::Sliding { idle_timeout, max_lifetime } => {
                non_zero("idle_timeout", *idle_timeout)?;
                non_zero("max_lifetime", *max_lifetime)?;
                if idle_timeout > max_lifetime {
                    return Err(ConfigError::Invalid {
                        field: "idle_timeout",
                        reason: "must not exceed max_lifetime".into(),
                    });
                }
                Ok(())
            },
            Self::MultiUse { max_uses, time_to_live } => {
                at_least_one("max_uses", *max_uses)?;
                non_zero("time_to_live", *time_to_live)
            },
            Self::ThrottledUse { max_uses, window, time_to_live } => {
                at_least_one("max_uses", *max_uses)?;
                non_zero("window", *window)?;
                non_zero("time_to_live", *time_to_live)
            },
            Self::Any { policies } => {
                if policies.is_empty() {
                    return Err(ConfigError::Invalid {
                        field: "policies",
                        reason: "composite policy needs at least one member".into(),
                    });
                }
                policies.iter().try_for_each(Self::validate)
            },
        }
    }
}

/// Returns `true` if `now` lies strictly after `start + lifetime`.
///
/// A lifetime too large to represent never elapses.
fn past_deadline(start: DateTime<Utc>, lifetime: Duration, now: DateTime<Utc>) -> bool {
    TimeDelta::from_std(lifetime)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .is_some_and(|deadline| now > deadline)
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::BelowMinimum { field, min: "1ms".into(), value: "0s".into() });
    }
    Ok(())
}

fn at_least_one(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::BelowMinimum { field, min: "1".into(), value: "0".into() });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{Authentication, TicketKind};

    fn ticket_at(policy: ExpirationPolicy, created_at: DateTime<Utc>) -> Ticket {
        Ticket::builder()
            .id("TGT-1-test")
            .kind(TicketKind::TicketGranting)
            .authentication(Authentication::for_principal("alice"))
            .expiration_policy(policy)
            .created_at(created_at)
            .build()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn after(start: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
        start + TimeDelta::milliseconds(millis)
    }

    #[test]
    fn never_and_always() {
        let now = Utc::now();
        assert!(!ExpirationPolicy::Never.is_expired(&ticket_at(ExpirationPolicy::Never, now), now));
        let ticket = ticket_at(ExpirationPolicy::Always, now);
        assert!(ExpirationPolicy::Always.is_expired(&ticket, now));
    }

    #[test]
    fn hard_timeout_boundary() {
        let start = Utc::now();
        let policy = ExpirationPolicy::hard_timeout(secs(1));
        let ticket = ticket_at(policy.clone(), start);

        assert!(!policy.is_expired(&ticket, after(start, 1000)));
        assert!(policy.is_expired(&ticket, after(start, 1100)));
    }

    #[test]
    fn sliding_is_rearmed_by_use_but_capped() {
        let start = Utc::now();
        let policy = ExpirationPolicy::sliding(secs(10), secs(30));
        let mut ticket = ticket_at(policy.clone(), start);

        assert!(policy.is_expired(&ticket, after(start, 11_000)));

        ticket.record_use(after(start, 9_000));
        assert!(!policy.is_expired(&ticket, after(start, 11_000)));

        ticket.record_use(after(start, 18_000));
        ticket.record_use(after(start, 27_000));
        assert!(!policy.is_expired(&ticket, after(start, 29_000)));
        assert!(policy.is_expired(&ticket, after(start, 31_000)));
    }

    #[test]
    fn single_use_expires_after_one_use() {
        let start = Utc::now();
        let policy = ExpirationPolicy::single_use(secs(10));
        let mut ticket = ticket_at(policy.clone(), start);

        assert!(!policy.is_expired(&ticket, start));
        ticket.record_use(start);
        assert!(policy.is_expired(&ticket, start));
    }

    #[test]
    fn throttled_counts_only_uses_inside_window() {
        let start = Utc::now();
        let policy = ExpirationPolicy::throttled(2, secs(5), secs(60));
        let mut ticket = ticket_at(policy.clone(), start);

        ticket.record_use(after(start, 1_000));
        ticket.record_use(after(start, 2_000));
        assert!(policy.is_expired(&ticket, after(start, 3_000)));

        // Both uses have left the window.
        assert!(!policy.is_expired(&ticket, after(start, 8_000)));
        assert!(policy.is_expired(&ticket, after(start, 61_000)));
    }

    #[test]
    fn any_combines_members() {
        let start = Utc::now();
        let policy = ExpirationPolicy::any([
            ExpirationPolicy::hard_timeout(secs(100)),
            ExpirationPolicy::single_use(secs(100)),
        ]);
        let mut ticket = ticket_at(policy.clone(), start);
        assert!(!policy.is_expired(&ticket, start));
        ticket.record_use(start);
        assert!(policy.is_expired(&ticket, start));
    }

    #[test]
    fn validate_rejects_bad_parameters() {
        assert!(ExpirationPolicy::hard_timeout(Duration::ZERO).validate().is_err());
        assert!(ExpirationPolicy::multi_use(0, secs(1)).validate().is_err());
        assert!(ExpirationPolicy::sliding(secs(10), secs(5)).validate().is_err());
        assert!(ExpirationPolicy::any([]).validate().is_err());
        assert!(ExpirationPolicy::sliding(secs(5), secs(10)).validate().is_ok());
    }

    #[test]
    fn serde_round_trip_uses_humantime() {
        let policy = ExpirationPolicy::throttled(3, secs(30), secs(300));
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains(r#""window":"30s""#), "got {json}");
        let back: ExpirationPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    proptest! {
        #[test]
        fn hard_timeout_is_monotonic(lifetime_ms in 1u64..100_000, at_ms in 0i64..200_000) {
            let start = Utc::now();
            let policy = ExpirationPolicy::hard_timeout(Duration::from_millis(lifetime_ms));
            let ticket = ticket_at(policy.clone(), start);
            let now = after(start, at_ms);
            if policy.is_expired(&ticket, now) {
                prop_assert!(policy.is_expired(&ticket, after(now, 1)));
            }
            prop_assert_eq!(policy.is_expired(&ticket, now), at_ms > lifetime_ms as i64);
        }
    }
}
