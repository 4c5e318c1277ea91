//! Scheduled maintenance-reminder email jobs.
//!
//! A job is produced upstream (out of scope) in `pending`, claimed into `processing`
//! by exactly one dispatcher run, and always finished in `sent` or `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::geo::Coordinate;
use crate::id::{AccountId, JobId, RecipientId};

/// Persisted status of a maintenance-email job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailJobStatus {
    /// Waiting for its scheduled time and a dispatcher to claim it
    Pending,
    /// Claimed by a dispatcher run
    Processing,
    /// At least one recipient was handed to the mailer
    Sent,
    /// Nothing was delivered (no recipients, or every recipient failed)
    Failed,
}

impl EmailJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailJobStatus::Pending => "pending",
            EmailJobStatus::Processing => "processing",
            EmailJobStatus::Sent => "sent",
            EmailJobStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for EmailJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmailJobStatus::Pending),
            "processing" => Ok(EmailJobStatus::Processing),
            "sent" => Ok(EmailJobStatus::Sent),
            "failed" => Ok(EmailJobStatus::Failed),
            other => Err(DomainError::unknown_status(other)),
        }
    }
}

/// One addressee of a maintenance reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub email: String,
    pub display_name: Option<String>,
    pub bike_name: Option<String>,
    /// Where the bike was last ridden, used to mention a nearby shop area.
    pub last_known_location: Option<Coordinate>,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: RecipientId::new(),
            email: email.into(),
            display_name: None,
            bike_name: None,
            last_known_location: None,
        }
    }

    pub fn with_location(mut self, location: Coordinate) -> Self {
        self.last_known_location = Some(location);
        self
    }

    pub fn with_bike(mut self, bike_name: impl Into<String>) -> Self {
        self.bike_name = Some(bike_name.into());
        self
    }
}

/// A scheduled batch of maintenance reminders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceEmailJob {
    pub id: JobId,
    pub account_id: AccountId,
    /// Template identifier handed to the mailer; rendering is not our concern.
    pub template_key: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: EmailJobStatus,
    pub recipients: Vec<Recipient>,
    pub sent_count: u32,
    pub failed_count: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MaintenanceEmailJob {
    /// Create a new pending job.
    pub fn new(
        account_id: AccountId,
        template_key: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        recipients: Vec<Recipient>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            account_id,
            template_key: template_key.into(),
            scheduled_for,
            status: EmailJobStatus::Pending,
            recipients,
            sent_count: 0,
            failed_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and scheduled at or before `cutoff`.
    pub fn is_due(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == EmailJobStatus::Pending && self.scheduled_for <= cutoff
    }
}
