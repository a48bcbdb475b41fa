//! Session teardown and service notification.
//!
//! [`LogoutManager::destroy_ticket_granting_ticket`] ends a session:
//!
//! 1. The ticket graph below the TGT is walked through the child entries of
//!    each granting ticket. Granting children that are already gone are
//!    skipped.
//! 2. Every non-granting descendant issued for a service gets a signed
//!    [`LogoutMessage`] and the service's [`LogoutEndpoint`].
//! 3. The TGT and every descendant are deleted.
//! 4. Back-channel requests are posted concurrently, at most
//!    `max_concurrency` at a time, each attempt bounded by the dispatch
//!    timeout and retried per the retry policy. Front-channel requests are
//!    returned as redirect URLs.
//!
//! Deletion happens before any notification is awaited, so the session is
//! invalid for every validator whatever the services answer. Dispatch
//! failures are logged and recorded in the [`LogoutReport`]; they never fail
//! the logout.

use std::{collections::HashSet, fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use fail::fail_point;
use sso_common_registry::{LogoutHandler, TicketRegistry};
use sso_common_tickets::{
    DefaultTicketIdGenerator, Service, Ticket, TicketError, TicketIdGenerator, TicketKind,
};
use tokio::{sync::Semaphore, task::JoinSet};
use url::Url;

use crate::{
    config::LogoutConfig,
    error::{LogoutError, Result},
    message::{LogoutMessage, LogoutSigner},
    retry::{RetryConfig, with_retry},
    sender::{HttpLogoutSender, LOGOUT_REQUEST_PARAM, LogoutSender},
    service::{LogoutEndpoint, LogoutMode, LogoutServiceRegistry},
};

/// Prefix of logout message ids.
pub const LOGOUT_MESSAGE_PREFIX: &str = "LR";

/// Where a logout request ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutStatus {
    /// Not dispatched yet.
    Pending,
    /// The service acknowledged the back-channel notification.
    Delivered {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed, or the service rejected the notification.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        reason: String,
    },
    /// The caller must redirect the browser to this URL.
    Redirect(Url),
}

/// One notification to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    /// The ticket the service was given.
    pub ticket_id: String,
    /// The notified service.
    pub service: Service,
    /// Where and how it is notified.
    pub endpoint: LogoutEndpoint,
    /// The signed message.
    pub payload: String,
    /// Outcome.
    pub status: LogoutStatus,
}

/// Outcome of a logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutReport {
    /// The ticket-granting ticket that was logged out.
    pub session_id: String,
    /// Tickets removed from the registry, the TGT included.
    pub tickets_removed: usize,
    /// Every notification, in graph walk order.
    pub requests: Vec<LogoutRequest>,
}

impl LogoutReport {
    fn empty(session_id: &str) -> Self {
        Self { session_id: session_id.to_owned(), tickets_removed: 0, requests: Vec::new() }
    }

    /// Requests the services acknowledged.
    pub fn delivered(&self) -> impl Iterator<Item = &LogoutRequest> {
        self.requests.iter().filter(|r| matches!(r.status, LogoutStatus::Delivered { .. }))
    }

    /// Requests that could not be delivered.
    pub fn failed(&self) -> impl Iterator<Item = &LogoutRequest> {
        self.requests.iter().filter(|r| matches!(r.status, LogoutStatus::Failed { .. }))
    }

    /// Redirect URLs for front-channel services.
    pub fn redirects(&self) -> impl Iterator<Item = &Url> {
        self.requests.iter().filter_map(|r| match &r.status {
            LogoutStatus::Redirect(url) => Some(url),
            _ => None,
        })
    }
}

/// Ends sessions and notifies their services.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use sso_common_logout::{LogoutConfig, LogoutManager, LogoutSigner, StaticServiceRegistry};
/// use sso_common_registry::MemoryTicketRegistry;
///
/// # async fn example() -> Result<(), sso_common_logout::LogoutError> {
/// let manager = LogoutManager::from_config(
///     Arc::new(MemoryTicketRegistry::new()),
///     Arc::new(StaticServiceRegistry::default()),
///     Arc::new(LogoutSigner::generate()),
///     LogoutConfig::default(),
/// )?;
///
/// let report = manager.destroy_ticket_granting_ticket("TGT-1-abc").await?;
/// for url in report.redirects() {
///     println!("redirect browser to {url}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LogoutManager {
    registry: Arc<dyn TicketRegistry>,
    services: Arc<dyn LogoutServiceRegistry>,
    sender: Arc<dyn LogoutSender>,
    signer: Arc<LogoutSigner>,
    id_generator: Arc<dyn TicketIdGenerator>,
    config: LogoutConfig,
}

impl fmt::Debug for LogoutManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogoutManager")
            .field("services", &self.services)
            .field("signer", &self.signer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl LogoutManager {
    /// Creates a manager.
    #[builder]
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        services: Arc<dyn LogoutServiceRegistry>,
        sender: Arc<dyn LogoutSender>,
        signer: Arc<LogoutSigner>,
        #[builder(default = Arc::new(DefaultTicketIdGenerator::default()))] id_generator: Arc<
            dyn TicketIdGenerator,
        >,
        #[builder(default)] config: LogoutConfig,
    ) -> Self {
        Self { registry, services, sender, signer, id_generator, config }
    }

    /// Creates a manager that posts notifications over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`LogoutError::DispatchFailed`] if the HTTP client cannot be
    /// built.
    pub fn from_config(
        registry: Arc<dyn TicketRegistry>,
        services: Arc<dyn LogoutServiceRegistry>,
        signer: Arc<LogoutSigner>,
        config: LogoutConfig,
    ) -> Result<Self> {
        let sender = HttpLogoutSender::new(config.dispatch_timeout)?;
        Ok(Self::builder()
            .registry(registry)
            .services(services)
            .sender(Arc::new(sender))
            .signer(signer)
            .config(config)
            .build())
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LogoutConfig {
        &self.config
    }

    /// Destroys a session and notifies its services.
    ///
    /// An unknown or already destroyed session yields an empty report.
    ///
    /// # Errors
    ///
    /// - [`TicketError::TypeMismatch`] if `tgt_id` is not a ticket-granting
    ///   ticket.
    /// - Registry failures while reading or deleting the session.
    #[tracing::instrument(skip(self))]
    pub async fn destroy_ticket_granting_ticket(&self, tgt_id: &str) -> Result<LogoutReport> {
        let Some(tgt) = self.bounded(self.registry.fetch(tgt_id)).await? else {
            tracing::debug!("session already gone");
            return Ok(LogoutReport::empty(tgt_id));
        };
        if tgt.kind() != TicketKind::TicketGranting {
            return Err(TicketError::TypeMismatch {
                id: tgt_id.to_owned(),
                expected: TicketKind::TicketGranting,
                actual: tgt.kind(),
            }
            .into());
        }

        let requests = match self.collect_requests(&tgt).await {
            Ok(requests) => requests,
            Err(err) => {
                tracing::warn!(error = %err, "could not resolve session services, not notifying");
                Vec::new()
            },
        };

        let tickets_removed = self.bounded(self.registry.delete_with_count(tgt_id)).await?;
        tracing::debug!(tickets_removed, requests = requests.len(), "session destroyed");

        let requests = self.dispatch(requests).await;
        Ok(LogoutReport { session_id: tgt_id.to_owned(), tickets_removed, requests })
    }

    /// Destroys every session of a principal.
    ///
    /// # Errors
    ///
    /// Returns the first registry failure. Sessions destroyed before it stay
    /// destroyed.
    #[tracing::instrument(skip(self))]
    pub async fn destroy_sessions_for_principal(
        &self,
        principal_id: &str,
    ) -> Result<Vec<LogoutReport>> {
        let sessions = self.bounded(self.registry.sessions_for_principal(principal_id)).await?;
        let mut reports = Vec::with_capacity(sessions.len());
        for session in sessions {
            reports.push(self.destroy_ticket_granting_ticket(session.id()).await?);
        }
        Ok(reports)
    }

    /// Notifies the services of a session without deleting anything.
    ///
    /// The registry cleaner calls this through [`LogoutHandler`] for an
    /// expired session it is about to remove.
    ///
    /// # Errors
    ///
    /// Registry failures while walking the session, and signing failures.
    #[tracing::instrument(skip(self, tgt), fields(tgt_id = %tgt.id()))]
    pub async fn notify_session(&self, tgt: &Ticket) -> Result<LogoutReport> {
        let requests = self.collect_requests(tgt).await?;
        let requests = self.dispatch(requests).await;
        Ok(LogoutReport { session_id: tgt.id().to_owned(), tickets_removed: 0, requests })
    }

    /// Builds one request per non-granting descendant of `root` that was
    /// issued for a notified service. Proxy-granting callbacks are not
    /// notified; the proxy tickets below them are.
    ///
    /// Requests come from the child entries of each granting ticket, so a
    /// redeemed ticket the cleaner already removed is still announced. Only
    /// granting children are fetched, to reach the tickets they issued.
    ///
    /// # Errors
    ///
    /// Registry failures while walking, and signing failures.
    pub async fn collect_requests(&self, root: &Ticket) -> Result<Vec<LogoutRequest>> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let mut requests = Vec::new();
        let mut seen = HashSet::from([root.id().to_owned()]);
        let mut granting = vec![root.clone()];
        while let Some(parent) = granting.pop() {
            for child in parent.children() {
                if !seen.insert(child.id.clone()) {
                    continue;
                }
                if let Some(kind) = child.kind()
                    && !kind.is_granting()
                {
                    if let Some(service) = &child.service
                        && let Some(request) = self.build_request(root, &child.id, service)?
                    {
                        requests.push(request);
                    }
                    continue;
                }
                match self.bounded(self.registry.fetch(&child.id)).await? {
                    Some(ticket) if ticket.kind().is_granting() => granting.push(ticket),
                    Some(ticket) => {
                        if let Some(service) = ticket.service().or(child.service.as_ref())
                            && let Some(request) = self.build_request(root, &child.id, service)?
                        {
                            requests.push(request);
                        }
                    },
                    None => {
                        tracing::debug!(
                            ticket_id = %child.id,
                            "granting descendant already purged"
                        );
                    },
                }
            }
        }
        Ok(requests)
    }

    fn build_request(
        &self,
        root: &Ticket,
        ticket_id: &str,
        service: &Service,
    ) -> Result<Option<LogoutRequest>> {
        let Some(endpoint) = self.services.resolve(service) else {
            return Ok(None);
        };
        let message = LogoutMessage::builder()
            .message_id(self.id_generator.next_id(LOGOUT_MESSAGE_PREFIX))
            .session_index(ticket_id)
            .service(service.id())
            .principal_id(root.principal_id())
            .build();
        let payload = self.signer.sign(&message)?;
        let status = match endpoint.mode {
            LogoutMode::FrontChannel => {
                LogoutStatus::Redirect(redirect_url(&endpoint.url, &payload))
            },
            LogoutMode::BackChannel | LogoutMode::None => LogoutStatus::Pending,
        };
        Ok(Some(LogoutRequest {
            ticket_id: ticket_id.to_owned(),
            service: service.clone(),
            endpoint,
            payload,
            status,
        }))
    }

    /// Posts every pending back-channel request and records the outcome.
    #[tracing::instrument(skip(self, requests), fields(requests = requests.len()))]
    async fn dispatch(&self, mut requests: Vec<LogoutRequest>) -> Vec<LogoutRequest> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, request) in requests.iter().enumerate() {
            if request.status != LogoutStatus::Pending
                || request.endpoint.mode != LogoutMode::BackChannel
            {
                continue;
            }
            let permits = Arc::clone(&permits);
            let sender = Arc::clone(&self.sender);
            let retry = self.config.retry.clone();
            let timeout = self.config.dispatch_timeout;
            let url = request.endpoint.url.clone();
            let payload = request.payload.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (index, LogoutStatus::Failed { attempts: 0, reason: "closed".into() });
                };
                (index, send_with_retry(sender.as_ref(), &retry, timeout, &url, &payload).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, status)) => {
                    if let Some(request) = requests.get_mut(index) {
                        if let LogoutStatus::Failed { attempts, reason } = &status {
                            tracing::warn!(
                                ticket_id = %request.ticket_id,
                                url = %request.endpoint.url,
                                attempts,
                                reason = %reason,
                                "logout notification failed",
                            );
                        }
                        request.status = status;
                    }
                },
                Err(err) => tracing::error!(error = %err, "logout dispatch task failed"),
            }
        }

        for request in &mut requests {
            if request.status == LogoutStatus::Pending
                && request.endpoint.mode == LogoutMode::BackChannel
            {
                let reason = "dispatch did not complete".to_owned();
                request.status = LogoutStatus::Failed { attempts: 0, reason };
            }
        }
        requests
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = sso_common_tickets::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result.map_err(LogoutError::from),
            Err(_) => Err(TicketError::timeout().into()),
        }
    }
}

async fn send_with_retry(
    sender: &dyn LogoutSender,
    retry: &RetryConfig,
    timeout: Duration,
    url: &Url,
    payload: &str,
) -> LogoutStatus {
    let result = with_retry(retry, "logout_dispatch", || async move {
        fail_point!("logout-dispatch", |_| Err(LogoutError::dispatch_failed(
            url.as_str(),
            "injected failure"
        )));
        match tokio::time::timeout(timeout, sender.send(url, payload)).await {
            Ok(result) => result,
            Err(_) => Err(LogoutError::DispatchTimeout { url: url.to_string(), timeout }),
        }
    })
    .await;
    match result {
        Ok(((), attempts)) => LogoutStatus::Delivered { attempts },
        Err((err, attempts)) => LogoutStatus::Failed { attempts, reason: err.to_string() },
    }
}

fn redirect_url(endpoint: &Url, payload: &str) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut().append_pair(LOGOUT_REQUEST_PARAM, payload);
    url
}

#[async_trait]
impl LogoutHandler for LogoutManager {
    async fn perform_logout(&self, ticket: &Ticket) -> sso_common_tickets::Result<usize> {
        let report = self.notify_session(ticket).await?;
        Ok(report.delivered().count())
    }
}
