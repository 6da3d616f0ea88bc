//! Bearer credentials for the management and directory APIs.
//!
//! [`TokenProvider`] caches one credential per [`Audience`] and refreshes it
//! before expiry. The per-audience lock is held across the refresh, so
//! concurrent callers wait for a single in-flight acquisition instead of
//! issuing their own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::{CloudEndpoints, ExportCredentials};
use crate::error::{ExportError, ExportResult};
use crate::metrics::ExportMetrics;
use crate::rate_limit::BackoffPolicy;

/// API plane a credential is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Azure Resource Manager (subscriptions, groups, resources, role assignments).
    ResourceManager,
    /// Microsoft Graph (directory objects).
    Graph,
}

impl Audience {
    pub const ALL: [Audience; 2] = [Audience::ResourceManager, Audience::Graph];

    fn index(self) -> usize {
        match self {
            Self::ResourceManager => 0,
            Self::Graph => 1,
        }
    }

    /// OAuth2 scope requested for this audience.
    #[must_use]
    pub fn scope(&self, endpoints: &CloudEndpoints) -> String {
        let base = match self {
            Self::ResourceManager => &endpoints.management,
            Self::Graph => &endpoints.graph,
        };
        format!("{}/.default", base.trim_end_matches('/'))
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ResourceManager => "resource_manager",
            Self::Graph => "graph",
        })
    }
}

/// Token as returned by an [`IdentityProvider`].
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of fresh access tokens.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn acquire_token(&self, audience: Audience) -> ExportResult<AccessToken>;
}

/// OAuth2 token response from the identity platform.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Client-credentials flow against `{login}/{tenant}/oauth2/v2.0/token`.
#[derive(Debug)]
pub struct ClientCredentialsProvider {
    credentials: ExportCredentials,
    endpoints: CloudEndpoints,
    tenant_id: String,
    http_client: reqwest::Client,
}

impl ClientCredentialsProvider {
    pub fn new(
        credentials: ExportCredentials,
        endpoints: CloudEndpoints,
        tenant_id: impl Into<String>,
        timeout: std::time::Duration,
    ) -> ExportResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            credentials,
            endpoints,
            tenant_id: tenant_id.into(),
            http_client,
        })
    }
}

#[async_trait]
impl IdentityProvider for ClientCredentialsProvider {
    #[instrument(skip(self), fields(tenant_id = %self.tenant_id))]
    async fn acquire_token(&self, audience: Audience) -> ExportResult<AccessToken> {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.endpoints.login.trim_end_matches('/'),
            self.tenant_id
        );
        let scope = audience.scope(&self.endpoints);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            (
                "client_secret",
                self.credentials.client_secret.expose_secret().as_str(),
            ),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http_client
            .post(&token_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExportError::Throttled {
                url: token_url,
                attempts: 1,
            });
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Server {
                status: Some(status.as_u16()),
                attempts: 1,
                message: format!("Token endpoint failed: {body}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExportError::Auth(format!(
                "Token request failed with status {status}: {body}"
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExportError::Auth(format!("Failed to parse token response: {e}")))?;

        let expires_at = Utc::now() + Duration::seconds(token_response.expires_in);
        debug!(
            audience = %audience,
            "Acquired new token, expires at {}",
            expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        Ok(AccessToken {
            token: token_response.access_token,
            expires_at,
        })
    }
}

/// Cached bearer credential for one audience.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    audience: Audience,
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    #[must_use]
    pub fn new(audience: Audience, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            audience,
            token: token.into(),
            expires_at,
        }
    }

    #[must_use]
    pub fn audience(&self) -> Audience {
        self.audience
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true if the credential is expired or will expire within `margin`.
    #[must_use]
    pub fn is_expired(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("audience", &self.audience)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-audience credential cache with single-flight refresh.
pub struct TokenProvider {
    identity: Arc<dyn IdentityProvider>,
    slots: [Mutex<Option<Credential>>; 2],
    safety_margin: Duration,
    backoff: BackoffPolicy,
    metrics: Arc<ExportMetrics>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("safety_margin", &self.safety_margin)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    #[must_use]
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        safety_margin: std::time::Duration,
        backoff: BackoffPolicy,
        metrics: Arc<ExportMetrics>,
    ) -> Self {
        Self {
            identity,
            slots: [Mutex::new(None), Mutex::new(None)],
            safety_margin: Duration::from_std(safety_margin).unwrap_or_else(|_| Duration::zero()),
            backoff,
            metrics,
        }
    }

    /// Returns a valid credential, refreshing it if absent or near expiry.
    #[instrument(skip(self))]
    pub async fn get_token(&self, audience: Audience) -> ExportResult<Credential> {
        let mut slot = self.slots[audience.index()].lock().await;
        if let Some(cached) = slot.as_ref() {
            if !cached.is_expired(self.safety_margin) {
                return Ok(cached.clone());
            }
            debug!("Cached token is within the safety margin, refreshing");
        }

        let fresh = self.acquire_with_retry(audience).await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Replaces a credential the server rejected.
    ///
    /// If another caller already swapped in a different credential, that one
    /// is returned without a new acquisition.
    #[instrument(skip(self, rejected))]
    pub async fn refresh_rejected(
        &self,
        audience: Audience,
        rejected: &Credential,
    ) -> ExportResult<Credential> {
        let mut slot = self.slots[audience.index()].lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.token != rejected.token && !cached.is_expired(self.safety_margin) {
                return Ok(cached.clone());
            }
        }

        self.metrics.record_auth_refresh();
        *slot = None;
        let fresh = self.acquire_with_retry(audience).await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops the cached credential, forcing a refresh on next use.
    pub async fn invalidate(&self, audience: Audience) {
        *self.slots[audience.index()].lock().await = None;
    }

    async fn acquire_with_retry(&self, audience: Audience) -> ExportResult<Credential> {
        let mut attempt = 0u32;
        loop {
            self.metrics.record_token_acquisition();
            match self.identity.acquire_token(audience).await {
                Ok(issued) => {
                    let credential = Credential::new(audience, issued.token, issued.expires_at);
                    if credential.is_expired(self.safety_margin) {
                        return Err(ExportError::Auth(format!(
                            "Issued {audience} token expires within the safety margin"
                        )));
                    }
                    return Ok(credential);
                }
                Err(e) if e.is_transient() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for(attempt, None);
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Token acquisition failed, retrying"
                    );
                    self.metrics.record_retry(delay.as_millis() as u64);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ExportError::Auth(message)) => return Err(ExportError::Auth(message)),
                Err(e) => {
                    return Err(ExportError::Auth(format!(
                        "Could not obtain {audience} token: {e}"
                    )))
                }
            }
        }
    }
}
