//! Background worker wiring: backends, shared services and the two coordinators.

pub mod mailer;
pub mod runtime;

pub use mailer::LoggingMailer;
pub use runtime::{Backends, RunningWorker, Worker};
