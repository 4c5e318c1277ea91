//! Atomic claim-then-process over persisted records.
//!
//! ## Contract
//!
//! - `claim(id, cutoff)` performs one conditional update (`pending -> processing` only
//!   if the row is still pending and still due at `cutoff`) and, only when exactly one
//!   row changed, reads the full record in the same transaction.
//! - `Ok(None)` from `claim` is an expected multi-instance race, not an error.
//! - `finish(id, terminal)` is an unconditional terminal write performed by the claim
//!   winner. It reports `Ok(false)` when the row has vanished in the meantime.
//!
//! Postgres implementations live in `cadence-infra`; [`InMemoryClaimStore`] is the
//! shared test/dev implementation for any [`ClaimRecord`].

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// A persisted record with a claimable status.
pub trait ClaimRecord: Clone + Send + Sync + 'static {
    type Id: Copy + Eq + Hash + Display + Debug + Send + Sync + 'static;
    /// Terminal status plus outcome counters written after processing.
    type Terminal: Clone + Debug + Send + Sync + 'static;

    fn record_id(&self) -> Self::Id;

    /// Claimable ("pending") and due at `cutoff`. Re-checked at claim time, since the
    /// record may have changed after the batch query.
    fn is_due(&self, cutoff: DateTime<Utc>) -> bool;

    /// Ordering key for earliest-due-first scans.
    fn due_at(&self) -> DateTime<Utc>;

    /// Transition into the "processing" state.
    fn mark_claimed(&mut self, now: DateTime<Utc>);

    fn apply_terminal(&mut self, terminal: &Self::Terminal, now: DateTime<Utc>);
}

/// Storage boundary for claimable records.
#[async_trait]
pub trait ClaimableStore: Send + Sync {
    type Record: ClaimRecord;

    /// Ids of claimable records with `due_at <= cutoff`, earliest first, at most `limit`.
    async fn select_due(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<<Self::Record as ClaimRecord>::Id>, StoreError>;

    /// Conditionally claim a record that is still due at `cutoff`. `Ok(None)` means
    /// someone else won, the record is gone, or it stopped being due.
    async fn claim(
        &self,
        id: <Self::Record as ClaimRecord>::Id,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Self::Record>, StoreError>;

    /// Write the terminal state. `Ok(false)` if the record no longer exists.
    async fn finish(
        &self,
        id: <Self::Record as ClaimRecord>::Id,
        terminal: &<Self::Record as ClaimRecord>::Terminal,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S: ClaimableStore + ?Sized> ClaimableStore for Arc<S> {
    type Record = S::Record;

    async fn select_due(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<<Self::Record as ClaimRecord>::Id>, StoreError> {
        (**self).select_due(cutoff, limit).await
    }

    async fn claim(
        &self,
        id: <Self::Record as ClaimRecord>::Id,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Self::Record>, StoreError> {
        (**self).claim(id, cutoff).await
    }

    async fn finish(
        &self,
        id: <Self::Record as ClaimRecord>::Id,
        terminal: &<Self::Record as ClaimRecord>::Terminal,
    ) -> Result<bool, StoreError> {
        (**self).finish(id, terminal).await
    }
}

/// In-memory claim store for tests/dev.
///
/// The conditional update and the read happen under one lock, which gives the same
/// atomicity the Postgres store gets from its transaction.
#[derive(Debug)]
pub struct InMemoryClaimStore<R: ClaimRecord> {
    records: Mutex<HashMap<R::Id, R>>,
    unavailable: AtomicBool,
}

impl<R: ClaimRecord> Default for InMemoryClaimStore<R> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl<R: ClaimRecord> InMemoryClaimStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a record (the upstream producer's role).
    pub fn insert(&self, record: R) {
        self.lock().insert(record.record_id(), record);
    }

    pub fn get(&self, id: R::Id) -> Option<R> {
        self.lock().get(&id).cloned()
    }

    /// Delete a record, as another process might.
    pub fn remove(&self, id: R::Id) -> Option<R> {
        self.lock().remove(&id)
    }

    pub fn all(&self) -> Vec<R> {
        self.lock().values().cloned().collect()
    }

    /// Simulate the database going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<R::Id, R>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory claim store marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: ClaimRecord> ClaimableStore for InMemoryClaimStore<R> {
    type Record = R;

    async fn select_due(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<R::Id>, StoreError> {
        self.check_available()?;
        let records = self.lock();
        let mut due: Vec<&R> = records
            .values()
            .filter(|r| r.is_due(cutoff))
            .collect();
        due.sort_by_key(|r| r.due_at());
        Ok(due.into_iter().take(limit).map(|r| r.record_id()).collect())
    }

    async fn claim(&self, id: R::Id, cutoff: DateTime<Utc>) -> Result<Option<R>, StoreError> {
        self.check_available()?;
        let mut records = self.lock();
        match records.get_mut(&id) {
            Some(record) if record.is_due(cutoff) => {
                record.mark_claimed(Utc::now());
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finish(&self, id: R::Id, terminal: &R::Terminal) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut records = self.lock();
        match records.get_mut(&id) {
            Some(record) => {
                record.apply_terminal(terminal, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
