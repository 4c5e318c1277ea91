//! `cadence-core`: domain records shared by the coordination core and its adapters.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): identifiers,
//! the persisted job/session records that coordinators claim, and their status enums.

pub mod error;
pub mod geo;
pub mod id;
pub mod maintenance;
pub mod session;

pub use error::{DomainError, DomainResult};
pub use geo::Coordinate;
pub use id::{AccountId, JobId, RecipientId, SessionId};
pub use maintenance::{EmailJobStatus, MaintenanceEmailJob, Recipient};
pub use session::{Session, SessionStatus};
