//! Distributed mutual-exclusion lease over the shared KV store.
//!
//! A lease is a single key holding an opaque holder token with a TTL:
//!
//! - **Acquire** is one `SET NX` with TTL. Success yields a [`Lease`]; an existing key
//!   means another instance holds it.
//! - **Release** is an atomic compare-and-delete on the holder token, so a lease that
//!   expired and was re-acquired by someone else is never deleted by the old holder.
//! - **Expiry** is passive. A holder that crashes blocks others for at most one TTL.
//!
//! When the store itself is unreachable, each call site chooses an explicit
//! [`OnUnavailable`] policy instead of silently picking one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::kv::KeyValueStore;

/// What to do when the lease store cannot be reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OnUnavailable {
    /// Run the scan without exclusivity, logging a warning.
    ///
    /// Only safe when the work is additionally protected by per-record claims.
    ProceedUnlocked,
    /// Skip this cycle entirely.
    Skip,
}

/// A held lease. Ownership is proven by `holder_token` on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub holder_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a policy-aware acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttempt {
    /// This instance holds the lease and must release it.
    Acquired(Lease),
    /// Another instance holds the lease.
    Held,
    /// Store unavailable; policy says run without a lease.
    ProceedUnlocked,
    /// Store unavailable; policy says skip this cycle.
    Skipped,
}

impl LeaseAttempt {
    /// Whether the caller may go on to scan.
    pub fn may_proceed(&self) -> bool {
        matches!(self, LeaseAttempt::Acquired(_) | LeaseAttempt::ProceedUnlocked)
    }
}

/// Lease helper shared by every coordinator.
#[derive(Clone)]
pub struct DistributedLease {
    store: Arc<dyn KeyValueStore>,
    instance_id: String,
}

impl std::fmt::Debug for DistributedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLease")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl DistributedLease {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            instance_id: Uuid::now_v7().to_string(),
        }
    }

    /// Use a stable instance identifier (e.g. hostname) as the holder-token prefix.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Raw acquire: `Ok(Some(lease))` on success, `Ok(None)` when held elsewhere.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let holder_token = format!("{}:{}", self.instance_id, Uuid::now_v7());
        let acquired = self.store.set_if_absent(key, &holder_token, ttl).await?;
        if !acquired {
            return Ok(None);
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        Ok(Some(Lease {
            key: key.to_string(),
            holder_token,
            expires_at: Utc::now() + ttl,
        }))
    }

    /// Acquire applying the call site's unavailability policy. Never fails.
    pub async fn acquire(&self, key: &str, ttl: Duration, policy: OnUnavailable) -> LeaseAttempt {
        match self.try_acquire(key, ttl).await {
            Ok(Some(lease)) => {
                debug!(lease_key = %key, holder = %lease.holder_token, "lease acquired");
                LeaseAttempt::Acquired(lease)
            }
            Ok(None) => {
                info!(lease_key = %key, "lease held by another instance");
                LeaseAttempt::Held
            }
            Err(err) => match policy {
                OnUnavailable::ProceedUnlocked => {
                    warn!(
                        lease_key = %key,
                        error = %err,
                        "lease store unavailable; proceeding without lease"
                    );
                    LeaseAttempt::ProceedUnlocked
                }
                OnUnavailable::Skip => {
                    warn!(
                        lease_key = %key,
                        error = %err,
                        "lease store unavailable; skipping cycle"
                    );
                    LeaseAttempt::Skipped
                }
            },
        }
    }

    /// Release a held lease. Returns `true` if this call deleted it.
    ///
    /// Failures are logged, never propagated: the TTL bounds how long a stale lease lives.
    pub async fn release(&self, lease: &Lease) -> bool {
        match self
            .store
            .compare_and_delete(&lease.key, &lease.holder_token)
            .await
        {
            Ok(true) => {
                debug!(lease_key = %lease.key, "lease released");
                true
            }
            Ok(false) => {
                warn!(
                    lease_key = %lease.key,
                    "lease already expired or taken over before release"
                );
                false
            }
            Err(err) => {
                warn!(
                    lease_key = %lease.key,
                    error = %err,
                    "lease release failed; relying on TTL expiry"
                );
                false
            }
        }
    }
}
