//! Ticket issuance.
//!
//! [`TicketFactory`] builds typed tickets: it picks a fresh id for the kind,
//! copies the configured expiration policy, and registers the new id on the
//! parent with a single atomic registry mutation. It does not store the new
//! ticket; [`TicketFactory::issue`] does that and regenerates the id on the
//! rare duplicate.
//!
//! # Parent Rules
//!
//! | Kind | Parent |
//! |------|--------|
//! | TGT | none |
//! | ST | TGT |
//! | PT | PGT |
//! | PGT | TGT or PGT |
//! | OC | TGT |
//! | AT | TGT or RT |
//! | RT | TGT |

use std::{collections::BTreeSet, sync::Arc};

use sso_common_tickets::{
    Authentication, ChildTicket, ConfigError, DefaultTicketIdGenerator, OAuthGrant, Result,
    Service, Ticket, TicketError, TicketIdGenerator, TicketKind, TicketPolicyConfig,
};

use crate::{config::FactoryConfig, registry::TicketRegistry};

/// Attempts [`TicketFactory::issue`] makes when ids collide.
const MAX_ISSUE_ATTEMPTS: usize = 3;

/// Everything needed to create one ticket.
#[derive(Debug, Clone, bon::Builder)]
pub struct TicketRequest {
    /// Kind of ticket to create.
    pub kind: TicketKind,
    /// Authentication for a root ticket. Children inherit the parent's
    /// authentication when this is `None`.
    pub authentication: Option<Authentication>,
    /// Service the ticket is issued for.
    #[builder(into)]
    pub service: Option<Service>,
    /// Id of the granting ticket.
    #[builder(into)]
    pub parent_id: Option<String>,
    /// Primary credentials were presented with this request.
    #[builder(default)]
    pub credentials_provided: bool,
    /// OAuth client and scopes.
    pub oauth: Option<OAuthGrant>,
}

/// Creates tickets of every kind.
///
/// ```
/// use std::sync::Arc;
///
/// use sso_common_registry::{MemoryTicketRegistry, TicketFactory, TicketRegistry};
/// use sso_common_tickets::{Authentication, TicketError};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), TicketError> {
/// let registry = Arc::new(MemoryTicketRegistry::new());
/// let factory = TicketFactory::builder().registry(registry.clone()).build();
///
/// let tgt = factory.issue_ticket_granting(Authentication::for_principal("alice")).await?;
/// let st = factory.issue_service(tgt.id(), "https://app.example.com", false).await?;
///
/// assert!(st.from_new_login());
/// assert_eq!(registry.consume(st.id()).await?.id(), st.id());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TicketFactory {
    registry: Arc<dyn TicketRegistry>,
    id_generator: Arc<dyn TicketIdGenerator>,
    policies: TicketPolicyConfig,
    only_track_most_recent_session: bool,
}

#[bon::bon]
impl TicketFactory {
    /// Creates a factory.
    #[builder]
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        #[builder(default = Arc::new(DefaultTicketIdGenerator::default()))] id_generator: Arc<
            dyn TicketIdGenerator,
        >,
        #[builder(default)] policies: TicketPolicyConfig,
        #[builder(default)] only_track_most_recent_session: bool,
    ) -> Self {
        Self { registry, id_generator, policies, only_track_most_recent_session }
    }

    /// Creates a factory from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a policy or the node hint is invalid.
    pub fn from_config(
        registry: Arc<dyn TicketRegistry>,
        config: &FactoryConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.policies.validate()?;
        let id_generator =
            DefaultTicketIdGenerator::builder().maybe_node(config.node.clone()).build()?;
        Ok(Self {
            registry,
            id_generator: Arc::new(id_generator),
            policies: config.policies.clone(),
            only_track_most_recent_session: config.only_track_most_recent_session,
        })
    }

    /// Returns the registry tickets are linked through.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn TicketRegistry> {
        &self.registry
    }

    /// Creates a ticket without storing it.
    ///
    /// For a child ticket the parent must be valid; the new id is appended
    /// to the parent's children before this returns.
    ///
    /// # Errors
    ///
    /// - [`TicketError::InvalidPrincipal`] if the principal id is empty.
    /// - [`TicketError::NotFound`] if the parent is not valid.
    /// - [`TicketError::InvalidParent`] if the parent kind cannot grant `kind`.
    /// - [`TicketError::InvalidRequest`] for a missing service, parent or
    ///   OAuth grant.
    #[tracing::instrument(skip(self, request), fields(kind = %request.kind))]
    pub async fn create(&self, request: TicketRequest) -> Result<Ticket> {
        let TicketRequest {
            kind,
            authentication,
            service,
            parent_id,
            credentials_provided,
            oauth,
        } = request;

        if matches!(kind, TicketKind::Service | TicketKind::Proxy | TicketKind::OAuthCode)
            && service.is_none()
        {
            return Err(TicketError::invalid_request(format!("{kind} requires a service")));
        }

        let Some(parent_id) = parent_id else {
            if kind != TicketKind::TicketGranting {
                return Err(TicketError::invalid_request(format!("{kind} requires a parent")));
            }
            let authentication = authentication
                .ok_or_else(|| TicketError::invalid_request("TGT requires an authentication"))?;
            ensure_principal(&authentication)?;

            let ticket = Ticket::builder()
                .id(self.id_generator.next_for(kind))
                .kind(kind)
                .authentication(authentication)
                .expiration_policy(self.policies.policy_for(kind).clone())
                .from_new_login(true)
                .build();
            tracing::debug!(ticket_id = ticket.id(), "created session ticket");
            return Ok(ticket);
        };

        let parent = self.registry.get(&parent_id).await?;
        if !may_grant(parent.kind(), kind) {
            return Err(TicketError::invalid_parent(
                &parent_id,
                format!("{} cannot grant {kind}", parent.kind()),
            ));
        }

        let authentication = authentication.unwrap_or_else(|| parent.authentication().clone());
        ensure_principal(&authentication)?;

        let oauth = oauth.or_else(|| parent.oauth().cloned());
        if matches!(
            kind,
            TicketKind::OAuthCode | TicketKind::AccessToken | TicketKind::RefreshToken
        ) && oauth.is_none()
        {
            return Err(TicketError::invalid_request(format!("{kind} requires an OAuth grant")));
        }

        let id = self.id_generator.next_for(kind);
        let only_track_most_recent =
            self.only_track_most_recent_session && kind == TicketKind::Service;
        let grant = self
            .registry
            .append_child(
                &parent_id,
                ChildTicket { id: id.clone(), service: service.clone() },
                only_track_most_recent,
            )
            .await?;

        if let Some(replaced) = &grant.replaced {
            // The replaced ticket is no longer reachable from the session.
            if let Err(e) = self.registry.delete(replaced).await {
                tracing::warn!(
                    ticket_id = %replaced,
                    error = %e,
                    "failed to delete replaced ticket"
                );
            }
        }

        let from_new_login =
            kind == TicketKind::Service && (credentials_provided || grant.first_grant);
        let ticket = Ticket::builder()
            .id(id)
            .kind(kind)
            .authentication(authentication)
            .expiration_policy(self.policies.policy_for(kind).clone())
            .maybe_service(service)
            .parent_id(parent_id)
            .from_new_login(from_new_login)
            .maybe_oauth(oauth)
            .build();
        tracing::debug!(ticket_id = ticket.id(), parent_id = ticket.parent_id(), "granted ticket");
        Ok(ticket)
    }

    /// Creates a ticket and stores it, regenerating the id on collision.
    ///
    /// A colliding id names another ticket, so it is detached from the parent
    /// before the next attempt.
    ///
    /// # Errors
    ///
    /// As [`create`](Self::create), plus registry errors from `add`.
    pub async fn issue(&self, request: TicketRequest) -> Result<Ticket> {
        let mut last_error = None;
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let ticket = self.create(request.clone()).await?;
            match self.registry.add(ticket.clone()).await {
                Ok(()) => return Ok(ticket),
                Err(e @ TicketError::Duplicate { .. }) => {
                    tracing::warn!(ticket_id = ticket.id(), "ticket id collision, regenerating");
                    if let Some(parent_id) = ticket.parent_id() {
                        self.registry.remove_child(parent_id, ticket.id()).await?;
                    }
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| TicketError::internal("ticket issue loop ended early")))
    }

    /// Issues a ticket-granting ticket for a fresh login.
    pub async fn issue_ticket_granting(&self, authentication: Authentication) -> Result<Ticket> {
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::TicketGranting)
                .authentication(authentication)
                .build(),
        )
        .await
    }

    /// Issues a service ticket under a ticket-granting ticket.
    pub async fn issue_service(
        &self,
        tgt_id: &str,
        service: impl Into<Service>,
        credentials_provided: bool,
    ) -> Result<Ticket> {
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::Service)
                .service(service.into())
                .parent_id(tgt_id)
                .credentials_provided(credentials_provided)
                .build(),
        )
        .await
    }

    /// Issues a proxy-granting ticket for a proxy callback.
    pub async fn issue_proxy_granting(
        &self,
        parent_id: &str,
        callback: impl Into<Service>,
    ) -> Result<Ticket> {
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::ProxyGranting)
                .service(callback.into())
                .parent_id(parent_id)
                .build(),
        )
        .await
    }

    /// Issues a proxy ticket under a proxy-granting ticket.
    pub async fn issue_proxy(&self, pgt_id: &str, service: impl Into<Service>) -> Result<Ticket> {
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::Proxy)
                .service(service.into())
                .parent_id(pgt_id)
                .build(),
        )
        .await
    }

    /// Issues an OAuth authorization code.
    pub async fn issue_oauth_code(
        &self,
        tgt_id: &str,
        redirect_uri: impl Into<Service>,
        client_id: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Ticket> {
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::OAuthCode)
                .service(redirect_uri.into())
                .parent_id(tgt_id)
                .oauth(oauth_grant(client_id, scopes))
                .build(),
        )
        .await
    }

    /// Issues an OAuth access token under a session or refresh token.
    pub async fn issue_access_token(
        &self,
        parent_id: &str,
        client_id: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Ticket> {
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::AccessToken)
                .parent_id(parent_id)
                .oauth(oauth_grant(client_id, scopes))
                .build(),
        )
        .await
    }

    /// Issues an OAuth refresh token under a session.
    pub async fn issue_refresh_token(
        &self,
        tgt_id: &str,
        client_id: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Ticket> {
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::RefreshToken)
                .parent_id(tgt_id)
                .oauth(oauth_grant(client_id, scopes))
                .build(),
        )
        .await
    }

    /// Mints an access token from a refresh token, inheriting its grant.
    ///
    /// Records a use of the refresh token.
    pub async fn refresh_access_token(&self, refresh_token_id: &str) -> Result<Ticket> {
        self.registry.get_of_kind(refresh_token_id, TicketKind::RefreshToken).await?;
        self.issue(
            TicketRequest::builder()
                .kind(TicketKind::AccessToken)
                .parent_id(refresh_token_id)
                .build(),
        )
        .await
    }
}

impl std::fmt::Debug for TicketFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketFactory")
            .field("id_generator", &self.id_generator)
            .field("policies", &self.policies)
            .field("only_track_most_recent_session", &self.only_track_most_recent_session)
            .finish_non_exhaustive()
    }
}

fn ensure_principal(authentication: &Authentication) -> Result<()> {
    if authentication.principal_id().trim().is_empty() {
        return Err(TicketError::InvalidPrincipal);
    }
    Ok(())
}

fn may_grant(parent: TicketKind, child: TicketKind) -> bool {
    match parent {
        TicketKind::TicketGranting => matches!(
            child,
            TicketKind::Service
                | TicketKind::ProxyGranting
                | TicketKind::OAuthCode
                | TicketKind::AccessToken
                | TicketKind::RefreshToken
        ),
        TicketKind::ProxyGranting => {
            matches!(child, TicketKind::Proxy | TicketKind::ProxyGranting)
        },
        TicketKind::RefreshToken => child == TicketKind::AccessToken,
        _ => false,
    }
}

fn oauth_grant(
    client_id: impl Into<String>,
    scopes: impl IntoIterator<Item = impl Into<String>>,
) -> OAuthGrant {
    OAuthGrant {
        client_id: client_id.into(),
        scopes: scopes.into_iter().map(Into::into).collect::<BTreeSet<_>>(),
    }
}
