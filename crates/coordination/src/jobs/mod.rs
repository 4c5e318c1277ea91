//! The two production coordinators: maintenance-email dispatch and stale-session reaping.

pub mod maintenance;
pub mod sessions;

pub use maintenance::{
    EmailJobOutcome, InMemoryMaintenanceJobStore, MaintenanceDispatchJob, MaintenanceEmail,
    MaintenanceMailer, PlaceLookup, dispatcher_config,
};
pub use sessions::{
    InMemorySessionStore, NoopFinalizer, SessionFinalizer, SessionOutcome, StaleSessionReaper,
    reaper_config,
};
