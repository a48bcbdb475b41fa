//! Back-channel delivery of logout messages.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::header;
use url::{Url, form_urlencoded};

use crate::error::{LogoutError, Result};

/// Form field, and redirect query parameter, that carries the signed message.
pub const LOGOUT_REQUEST_PARAM: &str = "logoutRequest";

/// Delivers one signed logout message to a service.
#[async_trait]
pub trait LogoutSender: Send + Sync {
    /// Sends `payload` to `url`. One call is one attempt.
    async fn send(&self, url: &Url, payload: &str) -> Result<()>;
}

/// Sends logout messages as HTTP form POSTs.
///
/// Redirects are not followed. Any 2xx answer counts as delivered.
#[derive(Debug, Clone)]
pub struct HttpLogoutSender {
    client: reqwest::Client,
}

impl HttpLogoutSender {
    /// Creates a sender whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LogoutError::DispatchFailed`] if the HTTP client cannot be
    /// built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| LogoutError::DispatchFailed {
                url: String::new(),
                message: "failed to build HTTP client".into(),
                status: None,
                source: Some(Arc::new(e)),
            })?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogoutSender for HttpLogoutSender {
    async fn send(&self, url: &Url, payload: &str) -> Result<()> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair(LOGOUT_REQUEST_PARAM, payload)
            .finish();
        let response = self
            .client
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| LogoutError::DispatchFailed {
                url: url.to_string(),
                message: if e.is_timeout() { "request timed out".into() } else { e.to_string() },
                status: None,
                source: Some(Arc::new(e)),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LogoutError::rejected(url.as_str(), status.as_u16()))
        }
    }
}
