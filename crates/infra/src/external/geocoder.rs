//! Reverse geocoding through a throttled public API (Nominatim-compatible).
//!
//! Every upstream request goes through the shared [`RateLimitedGate`], and answers are
//! cached by rounded coordinate in a [`ReadThroughCache`]:
//!
//! | Upstream answer | Returned | Cached |
//! |-----------------|----------|--------|
//! | 2xx with an address | `Some(place)` | value, positive TTL |
//! | 2xx with `error` or no address | `None` | `Negative`, negative TTL |
//! | non-2xx, network or decode error | `None` | nothing |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use cadence_coordination::cache::{coordinate_key, round_coordinate};
use cadence_coordination::jobs::PlaceLookup;
use cadence_coordination::{
    CachedValue, KeyValueStore, RateLimitedGate, ReadThroughCache, ReadThroughCacheConfig,
};
use cadence_core::Coordinate;

use crate::config::GeocoderSettings;

pub const CACHE_NAMESPACE: &str = "geocode";

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("geocoder returned HTTP {0}")]
    Status(u16),
}

/// A resolved place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceDescription {
    pub display_name: String,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl PlaceDescription {
    pub fn from_display_name(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            locality: None,
            region: None,
            country: None,
        }
    }

    /// `"Locality, Region"` when known, otherwise the full display name.
    pub fn short_label(&self) -> String {
        match (&self.locality, &self.region) {
            (Some(locality), Some(region)) => format!("{locality}, {region}"),
            (Some(locality), None) => locality.clone(),
            (None, Some(region)) => region.clone(),
            (None, None) => self.display_name.clone(),
        }
    }
}

/// Durable entries written before the tagged envelope: a bare display string (quoted
/// or not), a bare place object, or JSON `null` for "nothing here".
pub fn decode_legacy_place(raw: &str) -> Option<CachedValue<PlaceDescription>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => Some(CachedValue::Negative),
        Ok(Value::String(name)) => Some(CachedValue::Found(PlaceDescription::from_display_name(
            name,
        ))),
        Ok(value @ Value::Object(_)) => serde_json::from_value::<PlaceDescription>(value)
            .ok()
            .map(CachedValue::Found),
        Ok(_) => None,
        Err(_) => Some(CachedValue::Found(PlaceDescription::from_display_name(
            trimmed,
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    address: Option<Address>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Address {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

impl ReverseResponse {
    fn into_place(self) -> Option<PlaceDescription> {
        if self.error.is_some() {
            return None;
        }
        let address = self.address?;
        let display_name = self.display_name?;
        Some(PlaceDescription {
            display_name,
            locality: address
                .city
                .or(address.town)
                .or(address.village)
                .or(address.hamlet),
            region: address.state,
            country: address.country,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub user_agent: String,
    pub positive_ttl: Duration,
    pub negative_ttl: Duration,
    pub request_timeout: Duration,
}

impl GeocoderConfig {
    pub fn new(base_url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: user_agent.into(),
            positive_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            negative_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_settings(settings: &GeocoderSettings) -> Self {
        Self::new(&settings.base_url, &settings.user_agent)
            .with_ttls(settings.cache_ttl, settings.negative_ttl)
    }

    pub fn with_ttls(mut self, positive: Duration, negative: Duration) -> Self {
        self.positive_ttl = positive;
        self.negative_ttl = negative;
        self
    }
}

pub struct Geocoder {
    http: reqwest::Client,
    gate: Arc<RateLimitedGate>,
    cache: Arc<ReadThroughCache<PlaceDescription>>,
    config: GeocoderConfig,
}

impl std::fmt::Debug for Geocoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geocoder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Geocoder {
    pub fn new(
        config: GeocoderConfig,
        gate: Arc<RateLimitedGate>,
        cache: Arc<ReadThroughCache<PlaceDescription>>,
    ) -> Result<Self, GeocodeError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            gate,
            cache,
            config,
        })
    }

    /// Place cache with the geocoder's namespace and legacy-entry upgrade.
    pub fn build_cache(
        capacity: usize,
        durable: Option<Arc<dyn KeyValueStore>>,
    ) -> ReadThroughCache<PlaceDescription> {
        let cache = ReadThroughCache::new(
            ReadThroughCacheConfig::new(CACHE_NAMESPACE).with_capacity(capacity),
        )
        .with_legacy_decoder(decode_legacy_place);
        match durable {
            Some(store) => cache.with_durable(store),
            None => cache,
        }
    }

    /// Resolve a coordinate. `None` means "nothing there" or "upstream trouble".
    pub async fn lookup(&self, coordinate: Coordinate) -> Option<PlaceDescription> {
        let key = coordinate_key(coordinate.lat, coordinate.lon);
        self.cache
            .get_or_load(&key, || async {
                match self.fetch(coordinate).await {
                    Ok(Some(place)) => Some((CachedValue::Found(place), self.config.positive_ttl)),
                    Ok(None) => Some((CachedValue::Negative, self.config.negative_ttl)),
                    Err(err) => {
                        warn!(key = %key, error = %err, "reverse geocode failed; not caching");
                        None
                    }
                }
            })
            .await
            .and_then(CachedValue::into_option)
    }

    #[instrument(skip(self), fields(lat = coordinate.lat, lon = coordinate.lon), err)]
    async fn fetch(&self, coordinate: Coordinate) -> Result<Option<PlaceDescription>, GeocodeError> {
        let lat = format!("{:.3}", round_coordinate(coordinate.lat));
        let lon = format!("{:.3}", round_coordinate(coordinate.lon));

        self.gate.acquire_slot().await;
        let response = self
            .http
            .get(format!("{}/reverse", self.config.base_url))
            .query(&[("format", "jsonv2"), ("lat", lat.as_str()), ("lon", lon.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let body: ReverseResponse = response.json().await?;
        let place = body.into_place();
        if place.is_none() {
            debug!(%lat, %lon, "no place at coordinate");
        }
        Ok(place)
    }
}

#[async_trait]
impl PlaceLookup for Geocoder {
    async fn place_label(&self, location: Coordinate) -> Option<String> {
        self.lookup(location).await.map(|place| place.short_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_coordination::InMemoryKvStore;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const AGENT: &str = "cadence-test/1.0 (ops@example.com)";

    fn denver() -> Coordinate {
        Coordinate::new(39.73921234, -104.99034567).unwrap()
    }

    fn geocoder(server: &MockServer, store: &Arc<InMemoryKvStore>) -> Geocoder {
        let cache = Geocoder::build_cache(16, Some(store.clone()));
        Geocoder::new(
            GeocoderConfig::new(server.uri(), AGENT),
            Arc::new(RateLimitedGate::new(Duration::from_millis(1))),
            Arc::new(cache),
        )
        .unwrap()
    }

    fn denver_body() -> Value {
        json!({
            "display_name": "Civic Center, Denver, Colorado, United States",
            "address": {
                "city": "Denver",
                "state": "Colorado",
                "country": "United States"
            }
        })
    }

    #[tokio::test]
    async fn resolves_and_caches_places() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .and(query_param("format", "jsonv2"))
            .and(query_param("lat", "39.739"))
            .and(query_param("lon", "-104.990"))
            .and(header("user-agent", AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(denver_body()))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryKvStore::arc();
        let geocoder = geocoder(&server, &store);

        let place = geocoder.lookup(denver()).await.unwrap();
        assert_eq!(place.short_label(), "Denver, Colorado");

        // a nearby point shares the rounded key and never reaches upstream
        let nearby = Coordinate::new(39.7391, -104.9903).unwrap();
        assert_eq!(geocoder.lookup(nearby).await, Some(place));
        assert!(store.get("geocode:39.739:-104.990").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn error_answers_are_cached_as_negative() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "Unable to geocode"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryKvStore::arc();
        let geocoder = geocoder(&server, &store);

        assert_eq!(geocoder.lookup(denver()).await, None);
        assert_eq!(geocoder.lookup(denver()).await, None);
        assert_eq!(
            store
                .get("geocode:39.739:-104.990")
                .await
                .unwrap()
                .as_deref(),
            Some(r#"{"kind":"negative"}"#)
        );
    }

    #[tokio::test]
    async fn upstream_failures_are_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let store = InMemoryKvStore::arc();
        let geocoder = geocoder(&server, &store);

        assert_eq!(geocoder.lookup(denver()).await, None);
        assert_eq!(geocoder.lookup(denver()).await, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn legacy_durable_entries_are_served_without_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(denver_body()))
            .expect(0)
            .mount(&server)
            .await;

        let store = InMemoryKvStore::arc();
        store
            .set(
                "geocode:39.739:-104.990",
                "Denver, Colorado",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let place = geocoder(&server, &store).lookup(denver()).await.unwrap();
        assert_eq!(place.display_name, "Denver, Colorado");
    }

    #[tokio::test]
    async fn place_label_uses_short_label() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(ResponseTemplate::new(200).set_body_json(denver_body()))
            .mount(&server)
            .await;

        let geocoder = geocoder(&server, &InMemoryKvStore::arc());
        assert_eq!(
            geocoder.place_label(denver()).await.as_deref(),
            Some("Denver, Colorado")
        );
    }

    #[test]
    fn legacy_shapes_decode() {
        assert_eq!(decode_legacy_place("null"), Some(CachedValue::Negative));
        assert_eq!(
            decode_legacy_place("\"Boulder, Colorado\""),
            Some(CachedValue::Found(PlaceDescription::from_display_name(
                "Boulder, Colorado"
            )))
        );
        assert_eq!(
            decode_legacy_place("Golden, Colorado"),
            Some(CachedValue::Found(PlaceDescription::from_display_name(
                "Golden, Colorado"
            )))
        );
        assert_eq!(decode_legacy_place("  "), None);
        assert_eq!(decode_legacy_place("42"), None);
    }

    #[test]
    fn short_label_falls_back_to_display_name() {
        let bare = PlaceDescription::from_display_name("Somewhere remote");
        assert_eq!(bare.short_label(), "Somewhere remote");
    }
}
