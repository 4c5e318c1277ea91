//! Worker configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | unset: in-memory stores |
//! | `REDIS_URL` | unset: in-memory KV store |
//! | `GEOCODER_BASE_URL` | `https://nominatim.openstreetmap.org` |
//! | `GEOCODER_USER_AGENT` | dev placeholder (warns) |
//! | `GEOCODER_MIN_INTERVAL_MS` | `1000` |
//! | `GEOCODE_CACHE_CAPACITY` | `1000` |
//! | `GEOCODE_CACHE_TTL_SECS` | 30 days |
//! | `GEOCODE_NEGATIVE_TTL_SECS` | 7 days |
//! | `EMAIL_DISPATCH_INTERVAL_SECS` | `60` |
//! | `SESSION_REAP_INTERVAL_SECS` | `30` |
//! | `SESSION_IDLE_TIMEOUT_SECS` | `1800` |
//! | `TOKEN_ENDPOINT_URL`, `TOKEN_CLIENT_ID`, `TOKEN_CLIENT_SECRET` | unset: token refresh disabled |

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEV_USER_AGENT: &str = "cadence-dev/0.1 (set GEOCODER_USER_AGENT)";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("{key} is required when {because} is set")]
    Missing { key: String, because: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeocoderSettings {
    pub base_url: String,
    /// Identifying `User-Agent`; the upstream's usage policy requires one.
    pub user_agent: String,
    pub min_interval: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub negative_ttl: Duration,
}

#[derive(Clone, PartialEq, Eq)]
pub struct TokenEndpointSettings {
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for TokenEndpointSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEndpointSettings")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub geocoder: GeocoderSettings,
    pub email_dispatch_interval: Duration,
    pub session_reap_interval: Duration,
    pub session_idle_timeout: Duration,
    pub token_endpoint: Option<TokenEndpointSettings>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map instead of touching the process env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set; using in-memory job and session stores");
        }
        let redis_url = get("REDIS_URL");
        if redis_url.is_none() {
            warn!("REDIS_URL not set; using in-memory lease and cache store");
        }

        let user_agent = get("GEOCODER_USER_AGENT").unwrap_or_else(|| {
            warn!("GEOCODER_USER_AGENT not set; using development default");
            DEV_USER_AGENT.to_string()
        });

        let geocoder = GeocoderSettings {
            base_url: get("GEOCODER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEOCODER_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            user_agent,
            min_interval: Duration::from_millis(parse_or(&get, "GEOCODER_MIN_INTERVAL_MS", 1000)?),
            cache_capacity: parse_or(&get, "GEOCODE_CACHE_CAPACITY", 1000)?,
            cache_ttl: Duration::from_secs(parse_or(
                &get,
                "GEOCODE_CACHE_TTL_SECS",
                30 * 24 * 60 * 60,
            )?),
            negative_ttl: Duration::from_secs(parse_or(
                &get,
                "GEOCODE_NEGATIVE_TTL_SECS",
                7 * 24 * 60 * 60,
            )?),
        };

        let token_endpoint = match get("TOKEN_ENDPOINT_URL") {
            None => None,
            Some(url) => {
                let required = |key: &str| {
                    get(key).ok_or_else(|| ConfigError::Missing {
                        key: key.to_string(),
                        because: "TOKEN_ENDPOINT_URL".to_string(),
                    })
                };
                Some(TokenEndpointSettings {
                    url,
                    client_id: required("TOKEN_CLIENT_ID")?,
                    client_secret: required("TOKEN_CLIENT_SECRET")?,
                })
            }
        };

        Ok(Self {
            database_url,
            redis_url,
            geocoder,
            email_dispatch_interval: Duration::from_secs(parse_nonzero_or(
                &get,
                "EMAIL_DISPATCH_INTERVAL_SECS",
                60,
            )?),
            session_reap_interval: Duration::from_secs(parse_nonzero_or(
                &get,
                "SESSION_REAP_INTERVAL_SECS",
                30,
            )?),
            session_idle_timeout: Duration::from_secs(parse_nonzero_or(
                &get,
                "SESSION_IDLE_TIMEOUT_SECS",
                30 * 60,
            )?),
            token_endpoint,
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

/// Schedules and timeouts where zero has no meaning.
fn parse_nonzero_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match parse_or(get, key, default)? {
        0 => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: "0".to_string(),
        }),
        value => Ok(value),
    }
}
