//! User sessions reaped after a period of inactivity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{AccountId, SessionId};

/// Persisted status of a session.
///
/// `Active` plays the role of "pending" for the reaper: the claim transition is
/// `active -> closing`, and `expired`/`failed` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closing,
    Expired,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closing => "closing",
            SessionStatus::Expired => "expired",
            SessionStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "closing" => Ok(SessionStatus::Closing),
            "expired" => Ok(SessionStatus::Expired),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(DomainError::unknown_status(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub account_id: AccountId,
    pub status: SessionStatus,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Session {
    pub fn new(account_id: AccountId, last_activity_at: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            account_id,
            status: SessionStatus::Active,
            last_activity_at,
            created_at: last_activity_at,
            closed_at: None,
            failure_reason: None,
        }
    }

    /// Active with no activity after `cutoff` (`now - idle_timeout`).
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && self.last_activity_at <= cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn idle_detection_respects_timeout() {
        let now = Utc::now();
        let session = Session::new(AccountId::new(), now - Duration::minutes(31));
        assert!(session.is_idle_since(now - Duration::minutes(30)));
        assert!(!session.is_idle_since(now - Duration::minutes(45)));
    }

    #[test]
    fn closing_sessions_are_never_idle_candidates() {
        let now = Utc::now();
        let mut session = Session::new(AccountId::new(), now - Duration::hours(2));
        session.status = SessionStatus::Closing;
        assert!(!session.is_idle_since(now - Duration::minutes(30)));
    }
}
