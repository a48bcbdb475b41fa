//! Where and how each service receives logout notifications.

use std::fmt;

use serde::{Deserialize, Serialize};
use sso_common_tickets::Service;
use url::Url;

/// How a service is told that a session ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutMode {
    /// Server-to-server POST from the logout manager.
    #[default]
    BackChannel,
    /// Browser redirect, performed by the caller of the logout.
    FrontChannel,
    /// The service is not notified.
    None,
}

/// A resolved logout destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutEndpoint {
    /// URL that receives the notification.
    pub url: Url,
    /// Delivery mode.
    pub mode: LogoutMode,
}

/// Resolves the logout endpoint of a service.
pub trait LogoutServiceRegistry: Send + Sync + fmt::Debug {
    /// Returns where `service` is notified, or `None` if it is not.
    fn resolve(&self, service: &Service) -> Option<LogoutEndpoint>;
}

/// A registered service and its logout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct RegisteredService {
    /// Prefix that normalized service URLs must start with.
    #[builder(into)]
    pub service_prefix: String,

    /// Dedicated logout URL. Notifications go to the service URL itself
    /// when unset.
    #[serde(default)]
    pub logout_url: Option<Url>,

    /// Delivery mode.
    #[serde(default)]
    #[builder(default)]
    pub mode: LogoutMode,
}

/// A fixed list of registered services.
///
/// The longest matching prefix wins. Services that match no entry use
/// `default_mode` with their own URL.
///
/// ```
/// use sso_common_logout::{
///     LogoutMode, LogoutServiceRegistry, RegisteredService, StaticServiceRegistry,
/// };
/// use sso_common_tickets::Service;
///
/// let registry = StaticServiceRegistry::builder()
///     .services(vec![
///         RegisteredService::builder()
///             .service_prefix("https://portal.example.com")
///             .mode(LogoutMode::FrontChannel)
///             .build(),
///     ])
///     .default_mode(LogoutMode::None)
///     .build();
///
/// let endpoint = registry.resolve(&Service::new("https://portal.example.com/app?x=1")).unwrap();
/// assert_eq!(endpoint.mode, LogoutMode::FrontChannel);
/// assert!(registry.resolve(&Service::new("https://other.example.com")).is_none());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct StaticServiceRegistry {
    /// Registered services.
    #[serde(default)]
    #[builder(default)]
    services: Vec<RegisteredService>,

    /// Mode for services that match no entry.
    #[serde(default)]
    #[builder(default)]
    default_mode: LogoutMode,
}

impl StaticServiceRegistry {
    fn lookup(&self, normalized: &str) -> Option<&RegisteredService> {
        self.services
            .iter()
            .filter(|s| normalized.starts_with(s.service_prefix.as_str()))
            .max_by_key(|s| s.service_prefix.len())
    }
}

impl LogoutServiceRegistry for StaticServiceRegistry {
    fn resolve(&self, service: &Service) -> Option<LogoutEndpoint> {
        let normalized = service.normalized();
        let (logout_url, mode) = match self.lookup(normalized) {
            Some(registered) => (registered.logout_url.clone(), registered.mode),
            None => (None, self.default_mode),
        };
        if mode == LogoutMode::None {
            return None;
        }
        let url = match logout_url {
            Some(url) => url,
            None => match Url::parse(normalized) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => url,
                Ok(_) | Err(_) => {
                    tracing::debug!(service = %service, "service is not an HTTP URL, skipping");
                    return None;
                },
            },
        };
        Some(LogoutEndpoint { url, mode })
    }
}
