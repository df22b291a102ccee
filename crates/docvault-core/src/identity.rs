//! Identity resolution for remote path scoping and storage authorization.
//!
//! Every remote path computed during a sync pass is scoped to the identity
//! returned here. It must be the identity the storage backend authorizes
//! against, not a transient session subject claim; conflating the two
//! produces systematic access-denied failures because paths end up scoped
//! to one identity type while authorization checks another.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::util::{compact_text, is_http_url};

const IDENTITY_HTTP_TIMEOUT_SECS: u64 = 10;

/// Stable, reinstall-durable namespace identifier for the current user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(Error::Validation("identity must not be empty".to_string()));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves the storage-authorization identity for the current session.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve the identity, failing with `AuthRequired` when no valid
    /// session exists.
    async fn resolve(&self) -> Result<Identity>;

    /// Drop any cached identity (sign-out).
    async fn invalidate(&self);
}

/// Fixed identity for tests and offline tooling.
pub struct StaticIdentity(Identity);

impl StaticIdentity {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        Ok(Self(Identity::new(id)?))
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentity {
    async fn resolve(&self) -> Result<Identity> {
        Ok(self.0.clone())
    }

    async fn invalidate(&self) {}
}

/// Provides the current session token, if any.
///
/// The CLI and app shells own session storage; the resolver only consumes
/// the token.
pub trait SessionTokenSource: Send + Sync {
    fn session_token(&self) -> Option<String>;
}

/// HTTP-backed identity resolver.
///
/// Exchanges the session token at the identity endpoint and caches the
/// returned storage identity for the rest of the process lifetime. The
/// cache is what makes one sync pass use a single consistent identity for
/// every remote path it computes.
pub struct HttpIdentityResolver<S: SessionTokenSource> {
    endpoint: String,
    client: reqwest::Client,
    tokens: S,
    cached: Mutex<Option<Identity>>,
}

impl<S: SessionTokenSource> HttpIdentityResolver<S> {
    pub fn new(endpoint: impl Into<String>, tokens: S) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(IDENTITY_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|error| Error::Network(error.to_string()))?;

        Ok(Self {
            endpoint,
            client,
            tokens,
            cached: Mutex::new(None),
        })
    }
}

#[async_trait]
impl<S: SessionTokenSource> IdentityResolver for HttpIdentityResolver<S> {
    async fn resolve(&self) -> Result<Identity> {
        let mut cached = self.cached.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let token = self
            .tokens
            .session_token()
            .ok_or_else(|| Error::AuthRequired("no active session".to_string()))?;

        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| Error::Network(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::AuthRequired(format!(
                "identity endpoint rejected session ({})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!(
                "identity endpoint returned HTTP {}: {}",
                status.as_u16(),
                compact_text(&body)
            )));
        }

        let payload = response
            .json::<IdentityResponse>()
            .await
            .map_err(|error| Error::Network(error.to_string()))?;
        let identity = payload.into_identity()?;

        tracing::debug!(identity = %identity, "resolved storage identity");
        *cached = Some(identity.clone());
        Ok(identity)
    }

    async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    /// Identity the storage backend authorizes against.
    storage_identity: Option<String>,
    /// Session subject claim. Present in some deployments; deliberately
    /// never used for path computation.
    #[serde(default)]
    subject: Option<String>,
}

impl IdentityResponse {
    fn into_identity(self) -> Result<Identity> {
        match self.storage_identity {
            Some(id) => Identity::new(id),
            None => Err(Error::AuthRequired(if self.subject.is_some() {
                "identity endpoint returned only a session subject; storage identity is required"
                    .to_string()
            } else {
                "identity endpoint response did not include storage_identity".to_string()
            })),
        }
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = raw.trim().trim_end_matches('/').to_string();
    if endpoint.is_empty() {
        return Err(Error::Validation(
            "identity endpoint must not be empty".to_string(),
        ));
    }
    if !is_http_url(&endpoint) {
        return Err(Error::Validation(
            "identity endpoint must include http:// or https://".to_string(),
        ));
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rejects_empty_values() {
        assert!(Identity::new("   ").is_err());
        assert!(Identity::new("us-east-1:abc").is_ok());
    }

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint("https://api.example.com/v1/identity/".to_string()).unwrap(),
            "https://api.example.com/v1/identity"
        );
    }

    #[test]
    fn response_requires_storage_identity() {
        let subject_only = IdentityResponse {
            storage_identity: None,
            subject: Some("sub-claim".to_string()),
        };
        assert!(matches!(
            subject_only.into_identity().unwrap_err(),
            Error::AuthRequired(_)
        ));

        let complete = IdentityResponse {
            storage_identity: Some("us-east-1:abc".to_string()),
            subject: Some("sub-claim".to_string()),
        };
        assert_eq!(
            complete.into_identity().unwrap().as_str(),
            "us-east-1:abc"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn static_identity_resolves() {
        let resolver = StaticIdentity::new("identity-1").unwrap();
        assert_eq!(resolver.resolve().await.unwrap().as_str(), "identity-1");
    }

    struct NoSession;
    impl SessionTokenSource for NoSession {
        fn session_token(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_session_fails_with_auth_required() {
        let resolver =
            HttpIdentityResolver::new("https://api.example.com/v1/identity", NoSession).unwrap();
        assert!(matches!(
            resolver.resolve().await.unwrap_err(),
            Error::AuthRequired(_)
        ));
    }
}
