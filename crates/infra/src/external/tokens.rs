//! OAuth token refresh for linked ride-tracking accounts.
//!
//! Refreshes are collapsed per account through a [`SingleFlightRegistry`]: when many
//! tasks find the same expired token, one of them talks to the token endpoint and
//! the rest receive its result (or its error).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use cadence_coordination::{SingleFlightRegistry, StoreError, SweeperHandle};
use cadence_core::AccountId;

use crate::config::TokenEndpointSettings;

/// Refresh when the token expires within this window.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(5 * 60);
/// A refresh older than this is treated as abandoned.
pub const REFRESH_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl TokenSet {
    pub fn is_valid_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        self.expires_at
            .checked_sub_signed(skew)
            .is_some_and(|refresh_at| refresh_at > now)
    }
}

/// Cloneable so every caller attached to a refresh gets the same error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenError {
    #[error("account {0} has no linked tokens")]
    NotLinked(AccountId),

    #[error("token endpoint rejected the refresh: {0}")]
    Rejected(String),

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for TokenError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn load(&self, account: AccountId) -> Result<Option<TokenSet>, StoreError>;
    async fn save(&self, account: AccountId, tokens: &TokenSet) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange `current.refresh_token` for a new token set.
    async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, TokenError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTokenRepository {
    tokens: Mutex<HashMap<AccountId, TokenSet>>,
}

impl InMemoryTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: AccountId, tokens: TokenSet) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account, tokens);
    }
}

#[async_trait]
impl TokenRepository for InMemoryTokenRepository {
    async fn load(&self, account: AccountId) -> Result<Option<TokenSet>, StoreError> {
        Ok(self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account)
            .cloned())
    }

    async fn save(&self, account: AccountId, tokens: &TokenSet) -> Result<(), StoreError> {
        self.insert(account, tokens.clone());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    /// Unix seconds.
    expires_at: Option<i64>,
    expires_in: Option<i64>,
}

/// `POST` form-encoded `grant_type=refresh_token` to the provider's token URL.
#[derive(Debug, Clone)]
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    settings: TokenEndpointSettings,
}

impl HttpTokenEndpoint {
    pub fn new(settings: TokenEndpointSettings) -> Result<Self, TokenError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http, settings })
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    #[instrument(skip(self, current), err)]
    async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, TokenError> {
        let response = self
            .http
            .post(&self.settings.url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected(format!("HTTP {}: {body}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(TokenError::Transport(format!("HTTP {}", status.as_u16())));
        }

        let body: RefreshResponse = response.json().await?;
        let expires_at = match (body.expires_at, body.expires_in) {
            (Some(at), _) => Utc
                .timestamp_opt(at, 0)
                .single()
                .ok_or_else(|| TokenError::Rejected(format!("invalid expires_at {at}")))?,
            (None, Some(secs)) => expiry_from_lifetime(Utc::now(), secs)?,
            (None, None) => {
                return Err(TokenError::Rejected("response carries no expiry".into()));
            }
        };

        Ok(TokenSet {
            access_token: body.access_token,
            refresh_token: body
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at,
        })
    }
}

/// `now + expires_in`, rejecting negative or unrepresentable lifetimes.
fn expiry_from_lifetime(now: DateTime<Utc>, secs: i64) -> Result<DateTime<Utc>, TokenError> {
    if secs < 0 {
        return Err(TokenError::Rejected(format!("invalid expires_in {secs}")));
    }
    chrono::TimeDelta::try_seconds(secs)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| TokenError::Rejected(format!("invalid expires_in {secs}")))
}

pub struct TokenRefresher {
    repository: Arc<dyn TokenRepository>,
    endpoint: Arc<dyn TokenEndpoint>,
    flights: Arc<SingleFlightRegistry<TokenSet, TokenError>>,
    skew: Duration,
}

impl std::fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("flights", &self.flights)
            .field("skew", &self.skew)
            .finish_non_exhaustive()
    }
}

impl TokenRefresher {
    pub fn new(repository: Arc<dyn TokenRepository>, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            repository,
            endpoint,
            flights: Arc::new(SingleFlightRegistry::new(REFRESH_MAX_AGE)),
            skew: DEFAULT_EXPIRY_SKEW,
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn spawn_sweeper(&self, every: Duration) -> SweeperHandle {
        self.flights.spawn_sweeper(every)
    }

    /// A currently valid access token for `account`, refreshing it if needed.
    pub async fn access_token(&self, account: AccountId) -> Result<String, TokenError> {
        let stored = self
            .repository
            .load(account)
            .await?
            .ok_or(TokenError::NotLinked(account))?;
        if stored.is_valid_at(Utc::now(), self.skew) {
            return Ok(stored.access_token);
        }

        let repository = Arc::clone(&self.repository);
        let endpoint = Arc::clone(&self.endpoint);
        let skew = self.skew;
        let tokens = self
            .flights
            .run_exclusive(&format!("token-refresh:{account}"), move || {
                refresh_account(repository, endpoint, account, skew)
            })
            .await?;
        Ok(tokens.access_token)
    }
}

async fn refresh_account(
    repository: Arc<dyn TokenRepository>,
    endpoint: Arc<dyn TokenEndpoint>,
    account: AccountId,
    skew: Duration,
) -> Result<TokenSet, TokenError> {
    // another instance may have refreshed since the caller's read
    let current = repository
        .load(account)
        .await?
        .ok_or(TokenError::NotLinked(account))?;
    if current.is_valid_at(Utc::now(), skew) {
        return Ok(current);
    }

    let refreshed = endpoint.refresh(&current).await?;
    repository.save(account, &refreshed).await?;
    info!(account_id = %account, expires_at = %refreshed.expires_at, "access token refreshed");
    Ok(refreshed)
}
