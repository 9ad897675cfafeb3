//! Access-token retrieval with OAuth refresh.
//!
//! A credential is refreshed when it expires within [`REFRESH_MARGIN_SECS`].
//! Refreshes of one credential are serialized so concurrent callers cause a
//! single exchange; the loser of the race re-reads the stored token.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::HookError;
use crate::provider::http::{ApiRequest, Transport};
use crate::provider::{ProviderKind, ProviderRegistry};
use crate::store::{Store, update_with_retry};
use crate::types::{Credential, ObjectKey, Watch};

/// Seconds before expiry at which a token is refreshed.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// OAuth client registered with a host, used for the refresh-token grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    NearExpiry,
    Refreshing,
    Refreshed,
    RefreshFailed,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, app: &OAuthApp, refresh_token: &str) -> Result<RefreshedToken, HookError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Standard refresh-token grant with client credentials in basic auth.
pub struct OAuthRefresher {
    transport: Arc<dyn Transport>,
}

impl OAuthRefresher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, app: &OAuthApp, refresh_token: &str) -> Result<RefreshedToken, HookError> {
        let request = ApiRequest::new(Method::POST, &app.token_url)
            .basic(&app.client_id, &app.client_secret)
            .header("accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ]);
        let response = self
            .transport
            .execute(request)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HookError::CredentialRefresh(e.to_string()))?;
        let token: TokenResponse = response
            .json()
            .map_err(|e| HookError::CredentialRefresh(e.to_string()))?;
        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expiry: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}

/// Whether `credential` must be refreshed at `now`. No expiry means it never does.
pub fn token_state(credential: &Credential, now: DateTime<Utc>) -> Result<TokenState, HookError> {
    let Some(raw) = credential.expiry.as_deref().filter(|e| !e.is_empty()) else {
        return Ok(TokenState::Valid);
    };
    let expiry = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| {
            HookError::Config(format!(
                "credential {} has invalid expiry '{raw}': {e}",
                credential.metadata.key()
            ))
        })?
        .with_timezone(&Utc);
    if expiry < now + Duration::seconds(REFRESH_MARGIN_SECS) {
        Ok(TokenState::NearExpiry)
    } else {
        Ok(TokenState::Valid)
    }
}

pub struct CredentialBroker {
    credentials: Arc<dyn Store<Credential>>,
    registry: ProviderRegistry,
    refresher: Arc<dyn TokenRefresher>,
    locks: parking_lot::Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialBroker {
    pub fn new(
        credentials: Arc<dyn Store<Credential>>,
        registry: ProviderRegistry,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            credentials,
            registry,
            refresher,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Token for calls made on behalf of `watch`; empty when it has no credential.
    pub async fn token_for(&self, watch: &Watch, kind: ProviderKind) -> Result<String, HookError> {
        match &watch.spec.credential {
            Some(key) => self.ensure(key, kind).await,
            None => Ok(String::new()),
        }
    }

    /// Returns a usable access token, refreshing it first when near expiry.
    pub async fn ensure(&self, key: &ObjectKey, kind: ProviderKind) -> Result<String, HookError> {
        let credential = self.credentials.get(key).await?;
        let Some(app) = self.refresh_app(&credential, kind) else {
            return Ok(credential.access_token);
        };
        if token_state(&credential, Utc::now())? == TokenState::Valid {
            return Ok(credential.access_token);
        }

        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(key, &app).await
        };
        drop(lock);
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
        result
    }

    async fn refresh_locked(&self, key: &ObjectKey, app: &OAuthApp) -> Result<String, HookError> {
        // Another caller may have refreshed while we waited.
        let credential = self.credentials.get(key).await?;
        if token_state(&credential, Utc::now())? == TokenState::Valid {
            return Ok(credential.access_token);
        }
        let Some(refresh_token) = credential.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(credential.access_token);
        };

        info!(credential = %key, state = ?TokenState::Refreshing, "refreshing access token");
        let refreshed = match self.refresher.refresh(app, refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(err) => {
                warn!(credential = %key, state = ?TokenState::RefreshFailed, error = %err, "token refresh failed");
                return Err(err);
            }
        };

        let stored = update_with_retry(self.credentials.as_ref(), key, |c| {
            c.access_token = refreshed.access_token.clone();
            if let Some(token) = &refreshed.refresh_token {
                c.refresh_token = Some(token.clone());
            }
            c.expiry = refreshed.expiry.map(|e| e.to_rfc3339());
            true
        })
        .await?;
        info!(credential = %key, state = ?TokenState::Refreshed, "access token refreshed");
        Ok(stored.access_token)
    }

    fn refresh_app(&self, credential: &Credential, kind: ProviderKind) -> Option<OAuthApp> {
        let has_refresh_token = credential
            .refresh_token
            .as_deref()
            .is_some_and(|t| !t.is_empty());
        if !has_refresh_token {
            return None;
        }
        let kind = credential.provider.unwrap_or(kind);
        self.registry
            .get(kind)
            .ok()
            .and_then(|client| client.oauth_app().cloned())
    }

    fn lock_for(&self, key: &ObjectKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }
}
