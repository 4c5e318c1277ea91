//! Infrastructure layer: DB, Redis, config, external services.

/// Database adapters (Postgres claim stores).
pub mod db;

/// Redis adapters (distributed leases, durable cache tier).
#[cfg(feature = "redis")]
pub mod redis;

/// Configuration loading and representation.
pub mod config;

/// External service clients/adapters.
pub mod external;

pub use config::{ConfigError, WorkerConfig};
