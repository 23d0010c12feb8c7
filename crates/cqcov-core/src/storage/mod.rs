//! Persistence for run records and batch jobs.
//!
//! Run records are append-only; the current state of a pair is always derived by picking the
//! newest record, never stored.

pub mod schema;
pub mod store;

pub use store::Store;

use crate::model::{BatchId, BatchJob, NewRunRecord, PairKey, RunRecord, RunRecordId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Append-only history of (CQ, MT) execution attempts.
pub trait RunRecordStore: Send + Sync {
    fn append(&self, record: &NewRunRecord) -> Result<RunRecordId, StoreError>;

    /// Newest record for one pair (latest `created_at`, ties broken by highest id).
    fn latest_by_pair(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
    ) -> Result<Option<RunRecord>, StoreError>;

    /// Bulk form of [`RunRecordStore::latest_by_pair`]. Pairs without records are absent.
    fn all_latest_for_universe(
        &self,
        project_id: &str,
        cq_ids: &[String],
        mt_ids: &[String],
    ) -> Result<HashMap<PairKey, RunRecord>, StoreError>;

    /// Records for one pair, newest first.
    fn history_for_pair(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
        limit: u32,
    ) -> Result<Vec<RunRecord>, StoreError>;
}

/// Result of [`BatchJobStore::claim_batch_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobClaim {
    Created(BatchId),
    /// The project already has a live non-terminal job.
    Busy(BatchJob),
}

/// Durable copy of batch job snapshots.
///
/// Every write stamps the row's `updated_at`; a non-terminal row that stops being updated belongs
/// to a process that died mid-batch.
pub trait BatchJobStore: Send + Sync {
    /// Persists a new job and returns its assigned id. `job.id` is ignored.
    fn create_batch_job(&self, job: &BatchJob) -> Result<BatchId, StoreError>;

    /// Creates `job` only if its project has no live non-terminal job, atomically with the check.
    ///
    /// Non-terminal rows of the project last updated before `stale_before` are first marked
    /// `failed` as abandoned.
    fn claim_batch_job(
        &self,
        job: &BatchJob,
        stale_before: DateTime<Utc>,
    ) -> Result<JobClaim, StoreError>;

    /// Overwrites status, counters and timestamps. Rows already in a terminal state are left alone
    /// and stored counters never decrease.
    fn save_batch_job(&self, job: &BatchJob) -> Result<(), StoreError>;

    fn get_batch_job(&self, id: BatchId) -> Result<Option<BatchJob>, StoreError>;
}

pub trait CoverageStore: RunRecordStore + BatchJobStore {}

impl<T: RunRecordStore + BatchJobStore> CoverageStore for T {}
