//! OAuth2 token lifecycle for an inbox.
//!
//! The access token lives in memory. It is refreshed when it expires within
//! [`REFRESH_MARGIN_SECS`] or when a server rejects it. A refreshed token is
//! handed to the registry's persister first; only when that succeeds does the
//! in-memory copy change. Refreshes for one inbox are serialized by a lock
//! the registry shares across adapter generations.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use deskmail_core::models::{OAuthConfig, OAuthProvider};
use deskmail_core::ChannelError;

use crate::base::TokenPersister;

/// Refresh this many seconds before the recorded expiry.
pub const REFRESH_MARGIN_SECS: i64 = 300;

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// SASL XOAUTH2 initial response.
pub fn xoauth2_payload(user: &str, access_token: &str) -> String {
    BASE64.encode(format!("user={user}\x01auth=Bearer {access_token}\x01\x01"))
}

/// Provider token endpoint.
pub fn token_endpoint(oauth: &OAuthConfig) -> String {
    match oauth.provider {
        OAuthProvider::Google => GOOGLE_TOKEN_URL.to_string(),
        OAuthProvider::Microsoft => {
            let tenant = if oauth.tenant_id.is_empty() {
                "common"
            } else {
                oauth.tenant_id.as_str()
            };
            format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token")
        }
    }
}

fn needs_refresh(oauth: &OAuthConfig, now: DateTime<Utc>) -> bool {
    if oauth.access_token.is_empty() {
        return true;
    }
    match oauth.expires_at {
        Some(expires_at) => (expires_at - now).num_seconds() < REFRESH_MARGIN_SECS,
        None => false,
    }
}

pub struct TokenManager {
    inbox_id: i64,
    state: RwLock<OAuthConfig>,
    refresh_lock: Arc<Mutex<()>>,
    persist: TokenPersister,
    http: reqwest::Client,
    endpoint: String,
}

impl TokenManager {
    pub fn new(
        inbox_id: i64,
        oauth: OAuthConfig,
        refresh_lock: Arc<Mutex<()>>,
        persist: TokenPersister,
    ) -> Self {
        let endpoint = token_endpoint(&oauth);
        Self {
            inbox_id,
            state: RwLock::new(oauth),
            refresh_lock,
            persist,
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint,
        }
    }

    /// Point at a different token endpoint (tests, sovereign clouds).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Current token, refreshing first when close to expiry.
    pub async fn access_token(&self) -> Result<String, ChannelError> {
        {
            let state = self.state.read().await;
            if !needs_refresh(&state, Utc::now()) {
                return Ok(state.access_token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;
        let current = self.state.read().await.clone();
        if !needs_refresh(&current, Utc::now()) {
            // refreshed by someone else while we waited
            return Ok(current.access_token);
        }
        self.refresh(current).await
    }

    /// Refresh after the server rejected `rejected`.
    ///
    /// If another task already replaced that token, the newer one is
    /// returned without another round trip.
    pub async fn force_refresh(&self, rejected: &str) -> Result<String, ChannelError> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.state.read().await.clone();
        if current.access_token != rejected && !current.access_token.is_empty() {
            return Ok(current.access_token);
        }
        self.refresh(current).await
    }

    /// Exchange the refresh token, persist, then swap in memory.
    /// Caller must hold the refresh lock.
    async fn refresh(&self, current: OAuthConfig) -> Result<String, ChannelError> {
        if current.refresh_token.is_empty() {
            return Err(ChannelError::Auth("no refresh token available".into()));
        }

        debug!(inbox_id = self.inbox_id, endpoint = %self.endpoint, "refreshing OAuth token");

        let response = self
            .http
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
                ("client_id", current.client_id.as_str()),
                ("client_secret", current.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ChannelError::Network(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChannelError::Protocol(format!("invalid token response: {e}")))?;

        if !status.is_success() {
            let error = body
                .get("error_description")
                .or_else(|| body.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            let msg = format!("token refresh failed ({status}): {error}");
            return Err(if status.is_server_error() {
                ChannelError::Network(msg)
            } else {
                ChannelError::Auth(msg)
            });
        }

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::Protocol("no access_token in token response".into()))?
            .to_string();

        let mut updated = current.clone();
        updated.access_token = access_token.clone();
        // Providers may rotate the refresh token; keep the old one otherwise.
        if let Some(rt) = body.get("refresh_token").and_then(|v| v.as_str()) {
            updated.refresh_token = rt.to_string();
        }
        updated.expires_at = body
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        if let Err(e) = (self.persist)(self.inbox_id, updated.clone()).await {
            warn!(inbox_id = self.inbox_id, error = %e, "refreshed token could not be persisted");
            return Err(match e {
                ChannelError::TokenPersist(_) => e,
                other => ChannelError::TokenPersist(other.to_string()),
            });
        }

        *self.state.write().await = updated;
        info!(inbox_id = self.inbox_id, "OAuth token refreshed");
        Ok(access_token)
    }

    pub async fn snapshot(&self) -> OAuthConfig {
        self.state.read().await.clone()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
