//! Cross-process coordination primitives for background work.
//!
//! ## Components
//!
//! - `RateLimitedGate`: FIFO gate enforcing a minimum spacing between upstream calls
//! - `ReadThroughCache`: bounded LRU tier + durable KV tier, with negative entries
//! - `SingleFlightRegistry`: collapses concurrent identical operations into one execution
//! - `DistributedLease`: TTL lease in a shared KV store with compare-and-delete release
//! - `ClaimableStore`: conditional `pending -> processing` claims over persisted records
//! - `PeriodicCoordinator`: lease + claim + unit of work in an overlap-safe scan loop
//!
//! Everything here is process-local except the `KeyValueStore` and the claim stores,
//! which are the only shared mutable state between instances.

pub mod cache;
pub mod claim;
pub mod coordinator;
pub mod error;
pub mod jobs;
pub mod kv;
pub mod lease;
pub mod rate_gate;
pub mod single_flight;
pub mod ticker;

pub use cache::{CachedValue, ReadThroughCache, ReadThroughCacheConfig};
pub use claim::{ClaimRecord, ClaimableStore, InMemoryClaimStore};
pub use coordinator::{
    CoordinatorConfig, CoordinatorHandle, PeriodicCoordinator, ScanJob, ScanReport, ScanSummary,
    StopOutcome,
};
pub use error::{JobError, StoreError};
pub use kv::{InMemoryKvStore, KeyValueStore};
pub use lease::{DistributedLease, Lease, LeaseAttempt, OnUnavailable};
pub use rate_gate::RateLimitedGate;
pub use single_flight::{SingleFlightRegistry, SweeperHandle};
pub use ticker::{StopSignal, Ticker};
