//! OAuth2 credential acquisition for Microsoft Graph.
//!
//! Tokens are obtained silently from the persisted cache when possible
//! (reusing a live access token, else redeeming the refresh token) and
//! otherwise through the device authorization grant, where the operator
//! enters a short code in a browser. Any change to the cache is written
//! back before the token is handed out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    reqwest, AuthType, ClientId, DeviceAuthorizationResponse, DeviceAuthorizationUrl,
    EndpointNotSet, EndpointSet, ErrorResponse, ExtraDeviceAuthorizationFields, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use invoicedrop_common::{Error, Result};

use super::cache::{CacheStore, CachedAccount, TokenCache};
use crate::config::AuthConfig;

/// Scopes added to every request so the server issues refresh material.
pub const RESERVED_SCOPES: &[&str] = &["offline_access"];

/// Progress of a single token acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Uninitialized,
    CacheLoaded,
    SilentlyAuthenticated,
    AwaitingUserCode,
    Authenticated,
    Persisted,
}

/// How a credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Live access token reused from the cache without a network call.
    Cache,
    /// Refresh token redeemed without user interaction.
    SilentRefresh,
    /// Interactive device authorization.
    DeviceFlow,
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Cache => write!(f, "token cache"),
            TokenSource::SilentRefresh => write!(f, "silent refresh"),
            TokenSource::DeviceFlow => write!(f, "device code flow"),
        }
    }
}

/// A bearer token for one logical operation.
///
/// Callers request a new credential per operation instead of holding on to
/// this one.
pub struct Credential {
    access_token: Zeroizing<String>,
    /// Application scopes the token was requested for.
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source: TokenSource,
}

impl Credential {
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("source", &self.source)
            .finish()
    }
}

/// Tokens returned by a successful exchange.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
    /// Scopes granted, when the server reports them.
    pub scopes: Option<Vec<String>>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Device authorization details shown to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device code, in seconds.
    pub expires_in: u64,
    /// Minimum polling interval, in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Ready-made instructions from the server, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_interval() -> u64 {
    5
}

impl DeviceAuthorization {
    /// Instructions for the operator.
    pub fn instructions(&self) -> String {
        match &self.message {
            Some(message) => message.clone(),
            None => format!(
                "To sign in, use a web browser to open the page {} and enter the code {} to authenticate.",
                self.verification_uri, self.user_code
            ),
        }
    }
}

/// Failure of a single exchange with the authorization server.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    /// The server answered with an OAuth2 error (invalid_grant, expired_token,
    /// access_denied, ...).
    #[error("rejected by authorization server: {0}")]
    Rejected(String),
    /// The request never produced a usable answer.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Seam between the credential manager and the authorization server.
#[async_trait]
pub trait AuthorizationBackend: Send + Sync {
    /// Redeem a refresh token for new tokens.
    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> std::result::Result<TokenGrant, ExchangeError>;

    /// Start a device authorization.
    async fn start_device_flow(
        &self,
        scopes: &[String],
    ) -> std::result::Result<DeviceAuthorization, ExchangeError>;

    /// Wait until the operator completes (or abandons) the authorization.
    ///
    /// `timeout` of `None` waits until the device code expires.
    async fn complete_device_flow(
        &self,
        authorization: &DeviceAuthorization,
        timeout: Option<Duration>,
    ) -> std::result::Result<TokenGrant, ExchangeError>;
}

/// Presents device authorization instructions to the operator.
pub trait DeviceCodePrompt: Send + Sync {
    fn present(&self, authorization: &DeviceAuthorization);
}

/// Prompt that writes the instructions to the log.
pub struct LogPrompt;

impl DeviceCodePrompt for LogPrompt {
    fn present(&self, authorization: &DeviceAuthorization) {
        warn!("{}", authorization.instructions());
    }
}

/// Extra fields of Microsoft's device authorization response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDeviceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExtraDeviceAuthorizationFields for GraphDeviceFields {}

type GraphDeviceDetails = DeviceAuthorizationResponse<GraphDeviceFields>;

type GraphOAuthClient =
    BasicClient<EndpointNotSet, EndpointSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Authorization backend talking to the Microsoft identity platform.
pub struct GraphAuthBackend {
    client: GraphOAuthClient,
    http: reqwest::Client,
}

impl GraphAuthBackend {
    /// Create a backend for the configured client and authority.
    ///
    /// # Errors
    /// - Invalid endpoint URLs
    /// - HTTP client construction failure
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_auth_type(AuthType::RequestBody)
            .set_token_uri(
                TokenUrl::new(config.token_url())
                    .map_err(|e| Error::Configuration(format!("Invalid token URL: {}", e)))?,
            )
            .set_device_authorization_url(
                DeviceAuthorizationUrl::new(config.device_authorization_url()).map_err(|e| {
                    Error::Configuration(format!("Invalid device authorization URL: {}", e))
                })?,
            );

        let http = reqwest::ClientBuilder::new()
            // Token endpoints must not redirect.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, http })
    }
}

fn to_scopes(scopes: &[String]) -> impl Iterator<Item = Scope> + '_ {
    scopes.iter().cloned().map(Scope::new)
}

fn classify<RE, T>(err: RequestTokenError<RE, T>) -> ExchangeError
where
    RE: std::error::Error + 'static,
    T: ErrorResponse + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => ExchangeError::Rejected(
            serde_json::to_string(&response).unwrap_or_else(|_| format!("{:?}", response)),
        ),
        other => ExchangeError::Transport(other.to_string()),
    }
}

fn grant_from<TR: TokenResponse>(response: &TR) -> TokenGrant {
    TokenGrant {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_in: response.expires_in(),
        scopes: response
            .scopes()
            .map(|scopes| scopes.iter().map(|s| s.as_str().to_string()).collect()),
    }
}

#[async_trait]
impl AuthorizationBackend for GraphAuthBackend {
    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> std::result::Result<TokenGrant, ExchangeError> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .add_scopes(to_scopes(scopes))
            .request_async(&self.http)
            .await
            .map_err(classify)?;

        Ok(grant_from(&response))
    }

    async fn start_device_flow(
        &self,
        scopes: &[String],
    ) -> std::result::Result<DeviceAuthorization, ExchangeError> {
        let details: GraphDeviceDetails = self
            .client
            .exchange_device_code()
            .add_scopes(to_scopes(scopes))
            .request_async(&self.http)
            .await
            .map_err(classify)?;

        serde_json::to_value(&details)
            .and_then(serde_json::from_value)
            .map_err(|e| {
                ExchangeError::Transport(format!("Unexpected device authorization response: {}", e))
            })
    }

    async fn complete_device_flow(
        &self,
        authorization: &DeviceAuthorization,
        timeout: Option<Duration>,
    ) -> std::result::Result<TokenGrant, ExchangeError> {
        let details: GraphDeviceDetails = serde_json::to_value(authorization)
            .and_then(serde_json::from_value)
            .map_err(|e| {
                ExchangeError::Transport(format!("Invalid device authorization: {}", e))
            })?;

        let response = self
            .client
            .exchange_device_access_token(&details)
            .request_async(&self.http, tokio::time::sleep, timeout)
            .await
            .map_err(classify)?;

        Ok(grant_from(&response))
    }
}

/// Owns the access token lifecycle for one credential store.
///
/// Every acquisition runs load, exchange and persist under a single lock, so
/// concurrent callers in this process never race on the cache file.
pub struct CredentialManager {
    config: AuthConfig,
    backend: Arc<dyn AuthorizationBackend>,
    store: Arc<dyn CacheStore>,
    prompt: Arc<dyn DeviceCodePrompt>,
    lock: Mutex<()>,
    state: std::sync::Mutex<AuthState>,
}

impl CredentialManager {
    /// Create a credential manager.
    ///
    /// # Errors
    /// - `Configuration` if the client ID or scopes are missing
    pub fn new(
        config: AuthConfig,
        backend: Arc<dyn AuthorizationBackend>,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backend,
            store,
            prompt: Arc::new(LogPrompt),
            lock: Mutex::new(()),
            state: std::sync::Mutex::new(AuthState::Uninitialized),
        })
    }

    /// Replace the device code prompt.
    pub fn with_prompt(mut self, prompt: Arc<dyn DeviceCodePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Last state reached by an acquisition.
    pub fn state(&self) -> AuthState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(AuthState::Uninitialized)
    }

    fn set_state(&self, state: AuthState) {
        if let Ok(mut current) = self.state.lock() {
            debug!("Credential state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Application scopes plus the reserved ones, as sent to the server.
    fn requested_scopes(&self) -> Vec<String> {
        let mut scopes = self.config.scopes.clone();
        for reserved in RESERVED_SCOPES {
            if !scopes.iter().any(|s| s.eq_ignore_ascii_case(reserved)) {
                scopes.push(reserved.to_string());
            }
        }
        scopes
    }

    /// Read the persisted cache.
    ///
    /// # Errors
    /// - `Configuration` if the blob exists but cannot be read or parsed
    pub async fn load_cache(&self) -> Result<TokenCache> {
        let cache = match self.store.load().await? {
            Some(blob) => TokenCache::deserialize(&blob)?,
            None => {
                debug!("No token cache at {}", self.store.describe());
                TokenCache::empty()
            }
        };
        self.set_state(AuthState::CacheLoaded);
        Ok(cache)
    }

    async fn persist(&self, cache: &mut TokenCache) -> Result<()> {
        let blob = cache.serialize()?;
        self.store.save(&blob).await?;
        cache.mark_persisted();
        debug!("Token cache written to {}", self.store.describe());
        Ok(())
    }

    /// Obtain a bearer token, waiting on the operator if necessary.
    pub async fn acquire_token(&self) -> Result<Credential> {
        self.acquire_token_cancellable(&CancellationToken::new())
            .await
    }

    /// Obtain a bearer token; `cancel` aborts a pending interactive wait.
    ///
    /// # Errors
    /// - `Configuration` for an unreadable cache
    /// - `Authentication` when the exchange fails or the device flow is
    ///   denied, expires or times out
    /// - `Cancelled` when `cancel` fires during the interactive wait
    pub async fn acquire_token_cancellable(&self, cancel: &CancellationToken) -> Result<Credential> {
        let _guard = self.lock.lock().await;
        self.set_state(AuthState::Uninitialized);

        let mut cache = self.load_cache().await?;

        let credential = match self.acquire_silent(&mut cache).await? {
            Some(credential) => credential,
            None => self.acquire_interactive(&mut cache, cancel).await?,
        };
        self.set_state(AuthState::Authenticated);

        if cache.has_state_changed() {
            self.persist(&mut cache).await?;
            self.set_state(AuthState::Persisted);
        }

        Ok(credential)
    }

    /// Try the cached account. `Ok(None)` means interactive authorization is
    /// required.
    async fn acquire_silent(&self, cache: &mut TokenCache) -> Result<Option<Credential>> {
        let Some(account) = cache
            .find_account(&self.config.client_id, &self.config.authority)
            .cloned()
        else {
            debug!("No cached account for this client");
            return Ok(None);
        };

        if account.has_usable_access_token(&self.config.scopes) {
            if let Some(token) = account.access_token.as_deref() {
                info!("Acquired token silently from cache");
                self.set_state(AuthState::SilentlyAuthenticated);
                return Ok(Some(self.credential(token, account.expires_at, TokenSource::Cache)));
            }
        }

        let Some(refresh_token) = account.refresh_token.as_deref() else {
            warn!("Cached account has no refresh token; interactive sign-in required");
            return Ok(None);
        };

        match self
            .backend
            .refresh(refresh_token, &self.requested_scopes())
            .await
        {
            Ok(grant) => {
                let updated = self.account_from_grant(Some(account), grant);
                let credential = self.credential_for(&updated, TokenSource::SilentRefresh)?;
                cache.upsert(updated);
                info!("Acquired token silently");
                self.set_state(AuthState::SilentlyAuthenticated);
                Ok(Some(credential))
            }
            Err(ExchangeError::Rejected(reason)) => {
                warn!(
                    "Silent token exchange rejected, falling back to device code flow: {}",
                    reason
                );
                Ok(None)
            }
            Err(ExchangeError::Transport(reason)) => Err(Error::Authentication(format!(
                "Silent token exchange failed: {}",
                reason
            ))),
        }
    }

    async fn acquire_interactive(
        &self,
        cache: &mut TokenCache,
        cancel: &CancellationToken,
    ) -> Result<Credential> {
        self.set_state(AuthState::AwaitingUserCode);

        let authorization = self
            .backend
            .start_device_flow(&self.requested_scopes())
            .await
            .map_err(|e| Error::Authentication(format!("Device flow initiation failed: {}", e)))?;

        info!("Initiating device code flow. Please authenticate.");
        self.prompt.present(&authorization);

        let grant = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Device code flow cancelled");
                return Err(Error::Cancelled { bytes_committed: 0 });
            }
            result = self
                .backend
                .complete_device_flow(&authorization, self.config.device_flow_timeout()) => {
                result.map_err(|e| Error::Authentication(format!("Failed to get access token: {}", e)))?
            }
        };

        let previous = cache
            .find_account(&self.config.client_id, &self.config.authority)
            .cloned();
        let account = self.account_from_grant(previous, grant);
        let credential = self.credential_for(&account, TokenSource::DeviceFlow)?;
        cache.upsert(account);
        info!("Acquired token via device code flow");
        Ok(credential)
    }

    /// Remove every cached account and persist the empty cache.
    pub async fn sign_out(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut cache = self.load_cache().await?;
        cache.clear();
        if cache.has_state_changed() {
            self.persist(&mut cache).await?;
            info!("Signed out; token cache cleared");
        }
        Ok(())
    }

    fn account_from_grant(&self, previous: Option<CachedAccount>, grant: TokenGrant) -> CachedAccount {
        let mut account = previous.unwrap_or_else(|| {
            CachedAccount::new(self.config.client_id.clone(), self.config.authority.clone())
        });

        let now = Utc::now();
        account.access_token = Some(grant.access_token);
        // Servers may omit a rotated refresh token; keep the old one then.
        if let Some(refresh_token) = grant.refresh_token {
            account.refresh_token = Some(refresh_token);
        }
        account.expires_at = grant
            .expires_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        account.scopes = grant.scopes.unwrap_or_else(|| self.requested_scopes());
        account.last_refresh = now;
        account
    }

    fn credential_for(&self, account: &CachedAccount, source: TokenSource) -> Result<Credential> {
        let token = account.access_token.as_deref().ok_or_else(|| {
            Error::Authentication("Authorization server returned no access token".to_string())
        })?;
        Ok(self.credential(token, account.expires_at, source))
    }

    fn credential(
        &self,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
        source: TokenSource,
    ) -> Credential {
        Credential {
            access_token: Zeroizing::new(token.to_string()),
            scopes: self.config.scopes.clone(),
            expires_at,
            source,
        }
    }
}
