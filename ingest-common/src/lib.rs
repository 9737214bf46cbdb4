// Internals stay private, the public API is re-exported below.

// Types
mod job;
pub use job::Job;
pub use job::JobStatus;
pub use job::NewJob;
pub use job::Registration;
pub use job::RowCounts;

mod staging;
pub use staging::NewStagingRow;
pub use staging::ProductionRow;
pub use staging::StagingRow;

// Errors
mod error;
// Errors from the backing store - connections, queries, transactions
pub use error::StoreError;
// A merge that was rolled back
pub use error::MergeError;

// Control store
mod store;
pub use store::ControlStore;
mod pgstore;
pub use pgstore::PgControlStore;

// Merge
mod merge;
pub use merge::classify;
pub use merge::dedup_latest;
pub use merge::Change;
pub use merge::MergeEngine;
pub use merge::MergeOutcome;
pub use merge::MergePlan;
mod pgmerge;
pub use pgmerge::PgMergeEngine;

// In-process store, implements both the control store and the merge engine
mod memory;
pub use memory::MemoryStore;

// Config
mod pool;
pub use pool::PoolConfig;

pub mod fingerprint;
pub mod metrics;
