use async_trait::async_trait;
use tracing::info;

use cadence_coordination::JobError;
use cadence_coordination::jobs::{MaintenanceEmail, MaintenanceMailer};

/// Mailer for deployments without an outbound email provider: every email is
/// logged and reported as delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMailer;

#[async_trait]
impl MaintenanceMailer for LoggingMailer {
    async fn send(&self, email: &MaintenanceEmail) -> Result<(), JobError> {
        if email.to.trim().is_empty() {
            return Err(JobError::invalid("recipient has no email address"));
        }
        info!(
            job_id = %email.job_id,
            account_id = %email.account_id,
            template = %email.template_key,
            bike = email.bike_name.as_deref().unwrap_or("-"),
            location = email.location_label.as_deref().unwrap_or("-"),
            "maintenance email queued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{AccountId, JobId};

    fn email(to: &str) -> MaintenanceEmail {
        MaintenanceEmail {
            job_id: JobId::new(),
            account_id: AccountId::new(),
            template_key: "chain-service".into(),
            to: to.into(),
            display_name: None,
            bike_name: Some("Commuter".into()),
            location_label: None,
        }
    }

    #[tokio::test]
    async fn accepts_addressed_emails() {
        assert!(LoggingMailer.send(&email("rider@example.com")).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_blank_addresses() {
        assert!(matches!(
            LoggingMailer.send(&email("  ")).await,
            Err(JobError::Invalid(_))
        ));
    }
}
