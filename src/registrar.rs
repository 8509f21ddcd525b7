//! Registrar HTTP client
//!
//! The registrar is the external system of record for externally reachable
//! services. It exposes two endpoints, both taking the same JSON body:
//!
//! - `POST /services/register`
//! - `POST /services/registercancel`
//!
//! Registrations are expected to be idempotent on the registrar side; this
//! client never deduplicates.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Path of the register endpoint
pub const REGISTER_PATH: &str = "/services/register";
/// Path of the unregister endpoint
pub const UNREGISTER_PATH: &str = "/services/registercancel";

/// Maximum number of response body bytes kept for logging
const MAX_LOGGED_BODY: usize = 1024;

/// Wire payload sent to both registrar endpoints
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Service name
    #[serde(rename = "sName")]
    pub service_name: String,
    /// Listener IP the service is reachable on
    #[serde(rename = "lSip")]
    pub listener_ip: String,
}

impl RegistrationRequest {
    /// Create a new request
    pub fn new(service_name: impl Into<String>, listener_ip: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            listener_ip: listener_ip.into(),
        }
    }

    /// Encode the request body
    ///
    /// An encoding failure aborts the call; a partial or empty body is never
    /// sent.
    pub fn to_body(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::serialization(&self.service_name, e.to_string()))
    }
}

/// Which registrar endpoint a call targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrarAction {
    /// Announce a service
    Register,
    /// Withdraw a service
    Unregister,
}

impl RegistrarAction {
    /// Endpoint path for this action
    pub fn path(&self) -> &'static str {
        match self {
            RegistrarAction::Register => REGISTER_PATH,
            RegistrarAction::Unregister => UNREGISTER_PATH,
        }
    }

    /// Short name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrarAction::Register => "register",
            RegistrarAction::Unregister => "unregister",
        }
    }
}

/// Trait abstracting the registrar so the reconciler can be tested without HTTP
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Announce a service; returns the registrar's response body
    async fn register(&self, request: &RegistrationRequest) -> Result<String, Error>;

    /// Withdraw a service; returns the registrar's response body
    async fn unregister(&self, request: &RegistrationRequest) -> Result<String, Error>;
}

/// Registrar client over HTTP
pub struct HttpRegistrar {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistrar {
    /// Create a client for the registrar at `base_url` with a request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build registrar HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a registrar around an existing reqwest client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Full URL for an action
    pub fn url(&self, action: RegistrarAction) -> String {
        format!("{}{}", self.base_url, action.path())
    }

    async fn send(
        &self,
        action: RegistrarAction,
        request: &RegistrationRequest,
    ) -> Result<String, Error> {
        let url = self.url(action);
        let body = request.to_body()?;

        debug!(
            url = %url,
            service = %request.service_name,
            listener_ip = %request.listener_ip,
            "posting to registrar"
        );

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::registrar_transport(&url, e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::registrar_transport(&url, format!("reading body: {e}")))?;
        let text = truncate(text);

        if !status.is_success() {
            return Err(Error::registrar_status(&url, status.as_u16(), text));
        }

        info!(
            action = action.as_str(),
            service = %request.service_name,
            status = status.as_u16(),
            body = %text,
            "registrar accepted request"
        );
        Ok(text)
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, request: &RegistrationRequest) -> Result<String, Error> {
        self.send(RegistrarAction::Register, request).await
    }

    async fn unregister(&self, request: &RegistrationRequest) -> Result<String, Error> {
        self.send(RegistrarAction::Unregister, request).await
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_LOGGED_BODY {
        let mut cut = MAX_LOGGED_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_uses_registrar_field_names() {
        let body = RegistrationRequest::new("web-svc", "10.0.0.5")
            .to_body()
            .unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"sName":"web-svc","lSip":"10.0.0.5"}"#
        );
    }

    #[test]
    fn urls_join_without_double_slash() {
        let registrar = HttpRegistrar::with_client(reqwest::Client::new(), "http://reg:5000/");
        assert_eq!(
            registrar.url(RegistrarAction::Register),
            "http://reg:5000/services/register"
        );
        assert_eq!(
            registrar.url(RegistrarAction::Unregister),
            "http://reg:5000/services/registercancel"
        );
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(MAX_LOGGED_BODY + 10);
        let out = truncate(body);
        assert_eq!(out.len(), MAX_LOGGED_BODY + 3);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "é".repeat(MAX_LOGGED_BODY);
        let out = truncate(body);
        assert!(out.ends_with("..."));
        assert!(out.len() <= MAX_LOGGED_BODY + 3);
    }

    #[test]
    fn short_bodies_are_untouched() {
        assert_eq!(truncate("ok".to_string()), "ok");
    }
}
