//! Per-kind expiration policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ExpirationPolicy, TicketKind, error::ConfigError};

/// Expiration policy assigned to each ticket kind at creation.
///
/// Every field has a default, so an empty document is a valid configuration:
///
/// ```
/// use sso_common_tickets::{ExpirationPolicy, TicketKind, TicketPolicyConfig};
///
/// let config: TicketPolicyConfig = serde_json::from_str(
///     r#"{"service": {"type": "multi_use", "max_uses": 1, "time_to_live": "30s"}}"#,
/// )?;
/// assert_eq!(
///     config.policy_for(TicketKind::Service),
///     &ExpirationPolicy::single_use(std::time::Duration::from_secs(30)),
/// );
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct TicketPolicyConfig {
    /// Ticket-granting tickets. Default: 2h idle, 8h ceiling.
    #[serde(default = "default_ticket_granting")]
    #[builder(default = default_ticket_granting())]
    pub ticket_granting: ExpirationPolicy,

    /// Service tickets. Default: single use within 10s.
    #[serde(default = "default_service")]
    #[builder(default = default_service())]
    pub service: ExpirationPolicy,

    /// Proxy tickets. Default: single use within 10s.
    #[serde(default = "default_service")]
    #[builder(default = default_service())]
    pub proxy: ExpirationPolicy,

    /// Proxy-granting tickets. Default: same as ticket-granting tickets.
    #[serde(default = "default_ticket_granting")]
    #[builder(default = default_ticket_granting())]
    pub proxy_granting: ExpirationPolicy,

    /// OAuth authorization codes. Default: single use within 30s.
    #[serde(default = "default_oauth_code")]
    #[builder(default = default_oauth_code())]
    pub oauth_code: ExpirationPolicy,

    /// OAuth access tokens. Default: 2h idle, 8h ceiling.
    #[serde(default = "default_ticket_granting")]
    #[builder(default = default_ticket_granting())]
    pub access_token: ExpirationPolicy,

    /// OAuth refresh tokens. Default: 30 days.
    #[serde(default = "default_refresh_token")]
    #[builder(default = default_refresh_token())]
    pub refresh_token: ExpirationPolicy,
}

fn default_ticket_granting() -> ExpirationPolicy {
    ExpirationPolicy::sliding(Duration::from_secs(2 * 60 * 60), Duration::from_secs(8 * 60 * 60))
}

fn default_service() -> ExpirationPolicy {
    ExpirationPolicy::single_use(Duration::from_secs(10))
}

fn default_oauth_code() -> ExpirationPolicy {
    ExpirationPolicy::single_use(Duration::from_secs(30))
}

fn default_refresh_token() -> ExpirationPolicy {
    ExpirationPolicy::hard_timeout(Duration::from_secs(30 * 24 * 60 * 60))
}

impl Default for TicketPolicyConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TicketPolicyConfig {
    /// Returns the policy configured for `kind`.
    #[must_use]
    pub fn policy_for(&self, kind: TicketKind) -> &ExpirationPolicy {
        match kind {
            TicketKind::TicketGranting => &self.ticket_granting,
            TicketKind::Service => &self.service,
            TicketKind::Proxy => &self.proxy,
            TicketKind::ProxyGranting => &self.proxy_granting,
            TicketKind::OAuthCode => &self.oauth_code,
            TicketKind::AccessToken => &self.access_token,
            TicketKind::RefreshToken => &self.refresh_token,
        }
    }

    /// Validates every configured policy.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        TicketKind::ALL.into_iter().try_for_each(|kind| self.policy_for(kind).validate())
    }
}
