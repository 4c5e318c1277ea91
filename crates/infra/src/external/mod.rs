//! HTTP clients for third-party services.

pub mod geocoder;
pub mod tokens;

pub use geocoder::{GeocodeError, Geocoder, GeocoderConfig, PlaceDescription};
pub use tokens::{
    HttpTokenEndpoint, InMemoryTokenRepository, TokenEndpoint, TokenError, TokenRefresher,
    TokenRepository, TokenSet,
};
