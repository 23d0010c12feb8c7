#![allow(dead_code)]

use cqcov_core::catalog::StaticCatalog;
use cqcov_core::engine::{BatchScheduler, SchedulerOptions};
use cqcov_core::model::{
    BatchId, BatchJob, CompetencyQuestion, Microtheory, NewRunRecord, PairKey, RunRecord,
    RunRecordId,
};
use cqcov_core::providers::executor::FakeExecutor;
use chrono::{DateTime, Utc};
use cqcov_core::storage::{BatchJobStore, JobClaim, RunRecordStore, Store, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PROJECT: &str = "kb";

pub fn query(cq_id: &str) -> String {
    format!("SELECT ?x WHERE {{ ?x <urn:ex:{cq_id}> ?y }}")
}

/// 3 CQs x 2 MTs, every MT at revision "1".
pub fn catalog() -> Arc<StaticCatalog> {
    let catalog = StaticCatalog::new();
    catalog.insert_project(
        PROJECT,
        ["cq1", "cq2", "cq3"]
            .iter()
            .map(|id| CompetencyQuestion {
                id: id.to_string(),
                name: id.to_uppercase(),
                problem: None,
                query: query(id),
                default_mt: None,
            })
            .collect(),
        ["mt1", "mt2"]
            .iter()
            .map(|id| Microtheory {
                id: id.to_string(),
                label: id.to_string(),
                data_revision: "1".into(),
            })
            .collect(),
    );
    Arc::new(catalog)
}

pub fn store() -> Arc<Store> {
    let store = Store::memory().unwrap();
    store.init_schema().unwrap();
    Arc::new(store)
}

pub fn options(parallel: usize) -> SchedulerOptions {
    SchedulerOptions {
        parallel,
        timeout: Duration::from_secs(5),
        single_batch_per_project: true,
        job_lease: Duration::from_secs(60),
    }
}

pub fn scheduler(
    catalog: &Arc<StaticCatalog>,
    store: Arc<dyn cqcov_core::storage::CoverageStore>,
    executor: &Arc<FakeExecutor>,
    options: SchedulerOptions,
) -> BatchScheduler {
    BatchScheduler::new(catalog.clone(), store, executor.clone(), options)
}

/// Store whose appends start failing after `allowed` successful writes.
pub struct FlakyStore {
    inner: Store,
    allowed: usize,
    appends: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Store, allowed: usize) -> Self {
        Self {
            inner,
            allowed,
            appends: AtomicUsize::new(0),
        }
    }
}

impl RunRecordStore for FlakyStore {
    fn append(&self, record: &NewRunRecord) -> Result<RunRecordId, StoreError> {
        if self.appends.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(StoreError::InvalidRow("disk I/O error".into()));
        }
        self.inner.append(record)
    }

    fn latest_by_pair(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
    ) -> Result<Option<RunRecord>, StoreError> {
        self.inner.latest_by_pair(project_id, cq_id, mt_id)
    }

    fn all_latest_for_universe(
        &self,
        project_id: &str,
        cq_ids: &[String],
        mt_ids: &[String],
    ) -> Result<HashMap<PairKey, RunRecord>, StoreError> {
        self.inner.all_latest_for_universe(project_id, cq_ids, mt_ids)
    }

    fn history_for_pair(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
        limit: u32,
    ) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.history_for_pair(project_id, cq_id, mt_id, limit)
    }
}

impl BatchJobStore for FlakyStore {
    fn create_batch_job(&self, job: &BatchJob) -> Result<BatchId, StoreError> {
        self.inner.create_batch_job(job)
    }

    fn claim_batch_job(
        &self,
        job: &BatchJob,
        stale_before: DateTime<Utc>,
    ) -> Result<JobClaim, StoreError> {
        self.inner.claim_batch_job(job, stale_before)
    }

    fn save_batch_job(&self, job: &BatchJob) -> Result<(), StoreError> {
        self.inner.save_batch_job(job)
    }

    fn get_batch_job(&self, id: BatchId) -> Result<Option<BatchJob>, StoreError> {
        self.inner.get_batch_job(id)
    }
}
