//! Backend client and credential capabilities.
//!
//! The mapper only needs to build a client for a credential and ping it.
//! [`HttpClientFactory`] does that against the SonarQube Web API; tests
//! substitute their own factories.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Failure talking to the backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The client could not be configured (bad URL, bad token format)
    #[error("invalid client configuration: {0}")]
    Config(String),

    /// Transport-level failure
    #[error("request failed: {0}")]
    Request(String),

    /// Unexpected HTTP status
    #[error("unexpected status {0}")]
    Status(u16),

    /// Credential was rejected
    #[error("credential rejected by backend")]
    Unauthorized,
}

/// A client bound to one backend credential.
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Cheap liveness and credential check.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Base URL this client talks to.
    fn base_url(&self) -> &str;
}

/// Builds backend clients.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Build a client for `token` against `url`.
    async fn create_client(
        &self,
        token: &str,
        url: &str,
        organization: Option<&str>,
    ) -> Result<Arc<dyn BackendClient>, BackendError>;
}

/// External secret storage, consulted before inline tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Returns `true` if a credential exists for the account.
    async fn has_credential(&self, account_id: &str) -> bool;

    /// The credential for the account.
    async fn get_credential(&self, account_id: &str) -> Option<String>;
}

/// In-memory credential store.
#[derive(Default)]
pub struct StaticCredentialStore {
    credentials: HashMap<String, String>,
}

impl StaticCredentialStore {
    /// Create a store from `(account_id, token)` pairs.
    pub fn new(credentials: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            credentials: credentials.into_iter().collect(),
        }
    }
}

impl fmt::Debug for StaticCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentialStore")
            .field("accounts", &self.credentials.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn has_credential(&self, account_id: &str) -> bool {
        self.credentials.contains_key(account_id)
    }

    async fn get_credential(&self, account_id: &str) -> Option<String> {
        self.credentials.get(account_id).cloned()
    }
}

/// Builds [`HttpBackendClient`]s sharing one connection pool.
pub struct HttpClientFactory {
    http: reqwest::Client,
}

impl HttpClientFactory {
    /// Create a factory whose requests time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn create_client(
        &self,
        token: &str,
        url: &str,
        organization: Option<&str>,
    ) -> Result<Arc<dyn BackendClient>, BackendError> {
        if token.trim().is_empty() {
            return Err(BackendError::Config("empty token".to_string()));
        }
        let base = url::Url::parse(url).map_err(|e| BackendError::Config(format!("url '{url}': {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(BackendError::Config(format!("url '{url}' is not http(s)")));
        }

        Ok(Arc::new(HttpBackendClient {
            http: self.http.clone(),
            base_url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            organization: organization.map(str::to_string),
        }))
    }
}

/// SonarQube Web API client, health-probe surface only.
pub struct HttpBackendClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    organization: Option<String>,
}

impl HttpBackendClient {
    /// Organization key, for SonarCloud.
    #[must_use]
    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }
}

#[derive(Deserialize)]
struct ValidateResponse {
    valid: bool,
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn ping(&self) -> Result<(), BackendError> {
        let response = self
            .http
            .get(format!("{}/api/authentication/validate", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(BackendError::Unauthorized);
        }
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        if body.valid {
            Ok(())
        } else {
            Err(BackendError::Unauthorized)
        }
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl fmt::Debug for HttpBackendClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackendClient")
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_store_answers_lookups() {
        let store = StaticCredentialStore::new([("sa1".to_string(), "squ_1".to_string())]);

        tokio_test::block_on(async {
            assert!(store.has_credential("sa1").await);
            assert!(!store.has_credential("sa2").await);
            assert_eq!(store.get_credential("sa1").await.as_deref(), Some("squ_1"));
        });
    }

    #[tokio::test]
    async fn http_factory_rejects_bad_inputs() {
        let factory = HttpClientFactory::new(Duration::from_secs(1));

        assert!(matches!(
            factory.create_client("", "https://sonar.example.com", None).await,
            Err(BackendError::Config(_))
        ));
        assert!(matches!(
            factory.create_client("t", "ftp://sonar.example.com", None).await,
            Err(BackendError::Config(_))
        ));
    }

    #[tokio::test]
    async fn http_factory_trims_trailing_slash() {
        let factory = HttpClientFactory::new(Duration::from_secs(1));

        let client = factory
            .create_client("t", "https://sonar.example.com/", Some("acme"))
            .await
            .unwrap();

        assert_eq!(client.base_url(), "https://sonar.example.com");
    }
}
