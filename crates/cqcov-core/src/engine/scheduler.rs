use super::plan::{plan_work_set, WorkItem};
use crate::catalog::Catalog;
use crate::config::Settings;
use crate::coverage::{build_matrix, resolve_universe};
use crate::errors::{CoverageError, EntityKind, ExecutionFault, Result};
use crate::model::{
    now_utc, BatchCounts, BatchId, BatchJob, BatchRequest, BatchStatus, CompetencyQuestion,
    CoverageMatrix, ExecOutcome, Microtheory, NewRunRecord, Outcome, RunRecord, Selection,
};
use crate::providers::executor::QueryExecutor;
use crate::storage::{CoverageStore, JobClaim};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    /// Max pairs executing at once per job.
    pub parallel: usize,
    /// Budget for a single executor call.
    pub timeout: Duration,
    pub single_batch_per_project: bool,
    /// A non-terminal job row not updated for this long is treated as abandoned by its process.
    pub job_lease: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SchedulerOptions {
    fn from(s: &Settings) -> Self {
        Self {
            parallel: s.parallel(),
            timeout: s.timeout(),
            single_batch_per_project: s.single_batch_per_project(),
            job_lease: s.job_lease(),
        }
    }
}

/// Live state of one batch job. Only the scheduler mutates it.
struct JobState {
    id: BatchId,
    project_id: String,
    cqs: Selection,
    mts: Selection,
    force_rerun: bool,
    created_at: DateTime<Utc>,
    total_pairs: u64,
    scheduled_pairs: u64,
    skipped_pairs: u64,

    status: AtomicU8,
    completed_pairs: AtomicU64,
    failed_pairs: AtomicU64,
    cancel_requested: AtomicBool,
    faulted: AtomicBool,
    error: Mutex<Option<String>>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
    progress: watch::Sender<BatchJob>,
}

impl JobState {
    fn new(job: &BatchJob) -> Self {
        let (progress, _) = watch::channel(job.clone());
        Self {
            id: job.id,
            project_id: job.project_id.clone(),
            cqs: job.cqs.clone(),
            mts: job.mts.clone(),
            force_rerun: job.force_rerun,
            created_at: job.created_at,
            total_pairs: job.counts.total_pairs,
            scheduled_pairs: job.counts.scheduled_pairs,
            skipped_pairs: job.counts.skipped_pairs,
            status: AtomicU8::new(job.status.as_u8()),
            completed_pairs: AtomicU64::new(job.counts.completed_pairs),
            failed_pairs: AtomicU64::new(job.counts.failed_pairs),
            cancel_requested: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            error: Mutex::new(job.error.clone()),
            completed_at: Mutex::new(job.completed_at),
            progress,
        }
    }

    fn status(&self) -> BatchStatus {
        BatchStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Single compare-and-swap so a job reaches at most one terminal state.
    fn transition(&self, from: BatchStatus, to: BatchStatus) -> bool {
        let moved = self
            .status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved && to.is_terminal() {
            *lock(&self.completed_at) = Some(now_utc());
        }
        moved
    }

    fn should_stop(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst) || self.faulted.load(Ordering::SeqCst)
    }

    /// First fault wins; later ones are only logged by the caller.
    fn record_fault(&self, message: String) {
        if !self.faulted.swap(true, Ordering::SeqCst) {
            *lock(&self.error) = Some(message);
        }
    }

    fn snapshot(&self) -> BatchJob {
        BatchJob {
            id: self.id,
            project_id: self.project_id.clone(),
            cqs: self.cqs.clone(),
            mts: self.mts.clone(),
            force_rerun: self.force_rerun,
            status: self.status(),
            counts: BatchCounts {
                total_pairs: self.total_pairs,
                scheduled_pairs: self.scheduled_pairs,
                skipped_pairs: self.skipped_pairs,
                completed_pairs: self.completed_pairs.load(Ordering::SeqCst),
                failed_pairs: self.failed_pairs.load(Ordering::SeqCst),
            },
            error: lock(&self.error).clone(),
            created_at: self.created_at,
            completed_at: *lock(&self.completed_at),
        }
    }

    fn publish(&self) {
        self.progress.send_replace(self.snapshot());
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives (CQ, MT) pairs through the executor as background batch jobs.
///
/// Cheap to clone; clones share the job registry. The registry holds this process's unfinished
/// jobs; once a terminal snapshot is stored the job is read back from the store. With
/// `single_batch_per_project` the one-active-job rule is enforced through the store, so it also
/// holds across processes sharing a database.
#[derive(Clone)]
pub struct BatchScheduler {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn CoverageStore>,
    executor: Arc<dyn QueryExecutor>,
    options: SchedulerOptions,
    jobs: Arc<Mutex<HashMap<BatchId, Arc<JobState>>>>,
}

impl BatchScheduler {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn CoverageStore>,
        executor: Arc<dyn QueryExecutor>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            catalog,
            store,
            executor,
            options,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn build_matrix(
        &self,
        project_id: &str,
        cq_ids: Option<&[String]>,
        mt_ids: Option<&[String]>,
    ) -> Result<CoverageMatrix> {
        build_matrix(
            self.catalog.as_ref(),
            self.store.as_ref(),
            project_id,
            cq_ids,
            mt_ids,
        )
    }

    /// Plans and enqueues a batch, returning the `queued` snapshot.
    ///
    /// Execution continues on a spawned task, so this must be called inside a tokio runtime.
    pub fn start_batch(&self, request: BatchRequest) -> Result<BatchJob> {
        let universe = resolve_universe(
            self.catalog.as_ref(),
            &request.project_id,
            &request.cqs,
            &request.mts,
        )?;

        // Held until the job is registered so two requests cannot both pass the conflict check.
        let mut jobs = lock(&self.jobs);
        if self.options.single_batch_per_project {
            if let Some(active) = jobs
                .values()
                .find(|j| j.project_id == request.project_id && !j.status().is_terminal())
            {
                return Err(conflict(&request.project_id, active.id));
            }
        }

        let latest = self.store.all_latest_for_universe(
            &request.project_id,
            &universe.cq_ids(),
            &universe.mt_ids(),
        )?;
        let work = plan_work_set(&universe, &latest, request.force_rerun);

        let mut job = BatchJob {
            id: 0,
            project_id: request.project_id,
            cqs: request.cqs,
            mts: request.mts,
            force_rerun: request.force_rerun,
            status: BatchStatus::Queued,
            counts: BatchCounts {
                total_pairs: work.total_pairs,
                scheduled_pairs: work.items.len() as u64,
                skipped_pairs: work.skipped_pairs,
                ..Default::default()
            },
            error: None,
            created_at: now_utc(),
            completed_at: None,
        };
        job.id = if self.options.single_batch_per_project {
            let stale_before = stale_cutoff(job.created_at, self.options.job_lease);
            match self.store.claim_batch_job(&job, stale_before)? {
                JobClaim::Created(id) => id,
                JobClaim::Busy(active) => return Err(conflict(&job.project_id, active.id)),
            }
        } else {
            self.store.create_batch_job(&job)?
        };

        let state = Arc::new(JobState::new(&job));
        jobs.insert(job.id, state.clone());
        drop(jobs);

        tracing::info!(
            event = "cqcov.batch.queued",
            job_id = job.id,
            project = %job.project_id,
            total_pairs = job.counts.total_pairs,
            scheduled_pairs = job.counts.scheduled_pairs,
            skipped_pairs = job.counts.skipped_pairs,
            force_rerun = job.force_rerun,
            "batch job queued"
        );

        let this = self.clone();
        tokio::spawn(async move { this.run_job(state, work.items).await });
        Ok(job)
    }

    pub fn get_batch_status(&self, job_id: BatchId) -> Result<BatchJob> {
        if let Some(job) = self.lookup(job_id) {
            return Ok(job.snapshot());
        }
        self.stored_job(job_id)
    }

    /// Requests cooperative cancellation and returns the resulting snapshot.
    ///
    /// In-flight pairs still commit. Terminal jobs, and jobs owned by another process, are left
    /// untouched.
    pub fn cancel_batch(&self, job_id: BatchId) -> Result<BatchJob> {
        let Some(job) = self.lookup(job_id) else {
            return self.stored_job(job_id);
        };
        if job.status().is_terminal() {
            return Ok(job.snapshot());
        }

        job.cancel_requested.store(true, Ordering::SeqCst);
        tracing::info!(
            event = "cqcov.batch.cancel_requested",
            job_id,
            project = %job.project_id,
            "batch cancellation requested"
        );

        if job.transition(BatchStatus::Queued, BatchStatus::Cancelled) {
            self.retire(&job);
        }
        Ok(job.snapshot())
    }

    /// Snapshots pushed after each pair commit and each status change.
    pub fn subscribe(&self, job_id: BatchId) -> Result<watch::Receiver<BatchJob>> {
        if let Some(job) = self.lookup(job_id) {
            return Ok(job.progress.subscribe());
        }
        let (_, rx) = watch::channel(self.stored_job(job_id)?);
        Ok(rx)
    }

    /// Resolves with the terminal snapshot of a job.
    pub async fn wait(&self, job_id: BatchId) -> Result<BatchJob> {
        let mut rx = self.subscribe(job_id)?;
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            if rx.changed().await.is_err() {
                return Ok(rx.borrow().clone());
            }
        }
    }

    /// Runs one pair now, outside any batch, and appends its record.
    pub async fn execute_pair(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
    ) -> Result<RunRecord> {
        let universe = resolve_universe(
            self.catalog.as_ref(),
            project_id,
            &Selection::Only(vec![cq_id.to_string()]),
            &Selection::Only(vec![mt_id.to_string()]),
        )?;
        let (cq, mt) = universe
            .pairs()
            .next()
            .ok_or_else(|| CoverageError::not_found(EntityKind::CompetencyQuestion, cq_id))?;

        let (exec, duration_ms) = self.run_pair(cq, mt).await;
        let record =
            NewRunRecord::from_exec(project_id, cq, mt, &exec).with_duration_ms(duration_ms);
        let id = self.store.append(&record)?;

        tracing::info!(
            event = "cqcov.pair.executed",
            project = %project_id,
            cq = %cq_id,
            mt = %mt_id,
            outcome = record.outcome.as_str(),
            "pair executed"
        );
        Ok(record.into_record(id))
    }

    /// Records of one pair, newest first.
    pub fn history(
        &self,
        project_id: &str,
        cq_id: &str,
        mt_id: &str,
        limit: u32,
    ) -> Result<Vec<RunRecord>> {
        resolve_universe(
            self.catalog.as_ref(),
            project_id,
            &Selection::Only(vec![cq_id.to_string()]),
            &Selection::Only(vec![mt_id.to_string()]),
        )?;
        Ok(self
            .store
            .history_for_pair(project_id, cq_id, mt_id, limit)?)
    }

    fn lookup(&self, job_id: BatchId) -> Option<Arc<JobState>> {
        lock(&self.jobs).get(&job_id).cloned()
    }

    fn stored_job(&self, job_id: BatchId) -> Result<BatchJob> {
        self.store
            .get_batch_job(job_id)?
            .ok_or_else(|| CoverageError::not_found(EntityKind::BatchJob, job_id.to_string()))
    }

    /// Stores a terminal snapshot, drops the job from the registry and publishes. A job whose
    /// terminal row could not be written stays registered so its status remains readable.
    fn retire(&self, job: &JobState) {
        if self.persist(job) {
            lock(&self.jobs).remove(&job.id);
        }
        job.publish();
    }

    fn persist(&self, job: &JobState) -> bool {
        match self.store.save_batch_job(&job.snapshot()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    event = "cqcov.batch.persist_failed",
                    job_id = job.id,
                    error = %e,
                    "failed to persist batch job"
                );
                false
            }
        }
    }

    async fn run_job(self, job: Arc<JobState>, items: Vec<WorkItem>) {
        if !job.transition(BatchStatus::Queued, BatchStatus::Running) {
            // Cancelled while still queued.
            return;
        }
        if !self.persist(&job) {
            job.record_fault("run record store unavailable: cannot persist job".into());
        }
        job.publish();
        tracing::info!(
            event = "cqcov.batch.started",
            job_id = job.id,
            project = %job.project_id,
            scheduled_pairs = items.len(),
            parallel = self.options.parallel,
            "batch job running"
        );

        let sem = Arc::new(Semaphore::new(self.options.parallel.max(1)));
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            if job.should_stop() {
                break;
            }
            let permit = match sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            // Re-checked: a cancel may have arrived while waiting for a slot.
            if job.should_stop() {
                break;
            }

            let this = self.clone();
            let task_job = job.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.execute_item(&task_job, &item).await;
            }));
        }

        for h in handles {
            if let Err(e) = h.await {
                job.record_fault(format!("worker task failed: {}", e));
            }
        }

        let terminal = if job.faulted.load(Ordering::SeqCst) {
            BatchStatus::Failed
        } else if job.cancel_requested.load(Ordering::SeqCst) {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };
        if job.transition(BatchStatus::Running, terminal) {
            self.retire(&job);
        }

        let snapshot = job.snapshot();
        tracing::info!(
            event = "cqcov.batch.finished",
            job_id = snapshot.id,
            project = %snapshot.project_id,
            status = snapshot.status.as_str(),
            completed_pairs = snapshot.counts.completed_pairs,
            failed_pairs = snapshot.counts.failed_pairs,
            error = snapshot.error.as_deref().unwrap_or(""),
            "batch job finished"
        );
    }

    async fn execute_item(&self, job: &JobState, item: &WorkItem) {
        let revision = self.current_revision(&job.project_id, &item.mt);
        let (exec, duration_ms) = self.run_pair(&item.cq, &item.mt).await;
        let record = NewRunRecord::from_exec(&job.project_id, &item.cq, &item.mt, &exec)
            .with_data_revision(revision)
            .with_batch(Some(job.id))
            .with_duration_ms(duration_ms);

        match self.store.append(&record) {
            Ok(_) => {
                job.completed_pairs.fetch_add(1, Ordering::SeqCst);
                if record.outcome == Outcome::Fail {
                    job.failed_pairs.fetch_add(1, Ordering::SeqCst);
                }
                // Also the job's heartbeat. A missed write only delays the stored counters.
                self.persist(job);
                job.publish();
            }
            Err(e) => {
                tracing::error!(
                    event = "cqcov.batch.store_unavailable",
                    job_id = job.id,
                    cq = %item.cq.id,
                    mt = %item.mt.id,
                    error = %e,
                    "run record append failed; halting dispatch"
                );
                job.record_fault(CoverageError::from(e).to_string());
            }
        }
    }

    /// The MT revision as of dispatch, so the record names the data the query ran against. Falls
    /// back to the planned revision when the catalog no longer knows the MT.
    fn current_revision(&self, project_id: &str, mt: &Microtheory) -> String {
        match self.catalog.data_revision(project_id, &mt.id) {
            Ok(revision) => revision,
            Err(e) => {
                tracing::warn!(
                    event = "cqcov.pair.revision_unavailable",
                    project = %project_id,
                    mt = %mt.id,
                    error = %e,
                    "using planned data revision"
                );
                mt.data_revision.clone()
            }
        }
    }

    /// Executes one pair with the timeout applied. Executor errors, timeouts and panics come
    /// back as `fail` outcomes.
    async fn run_pair(&self, cq: &CompetencyQuestion, mt: &Microtheory) -> (ExecOutcome, u64) {
        let start = Instant::now();
        let executor = self.executor.clone();
        let query = cq.query.clone();
        let mt_id = mt.id.clone();
        let mut call = tokio::spawn(async move { executor.execute(&query, &mt_id).await });

        let result = match timeout(self.options.timeout, &mut call).await {
            Err(_) => {
                call.abort();
                Err(ExecutionFault::Timeout)
            }
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(e))) => Err(ExecutionFault::from_error(&e)),
            Ok(Err(join)) => Err(ExecutionFault::Panicked(panic_message(join))),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = result.unwrap_or_else(|fault| {
            tracing::warn!(
                event = "cqcov.pair.fault",
                cq = %cq.id,
                mt = %mt.id,
                provider = self.executor.provider_name(),
                reason = %fault,
                "pair execution fault recorded as fail"
            );
            ExecOutcome::fail(fault.reason())
        });
        (outcome, duration_ms)
    }
}

fn conflict(project_id: &str, active: BatchId) -> CoverageError {
    CoverageError::Conflict(format!(
        "project '{}' already has an active batch job ({})",
        project_id, active
    ))
}

fn stale_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::providers::executor::FakeExecutor;
    use crate::storage::Store;

    #[test]
    fn options_follow_settings_defaults() {
        let o = SchedulerOptions::default();
        assert_eq!(o.parallel, 4);
        assert_eq!(o.timeout, Duration::from_secs(30));
        assert!(o.single_batch_per_project);
        assert_eq!(o.job_lease, Duration::from_secs(90));
    }

    #[test]
    fn job_reaches_only_one_terminal_state() {
        let job = JobState::new(&BatchJob {
            id: 7,
            project_id: "p".into(),
            cqs: Selection::All,
            mts: Selection::All,
            force_rerun: false,
            status: BatchStatus::Queued,
            counts: BatchCounts::default(),
            error: None,
            created_at: now_utc(),
            completed_at: None,
        });
        assert!(job.transition(BatchStatus::Queued, BatchStatus::Cancelled));
        assert!(!job.transition(BatchStatus::Queued, BatchStatus::Running));
        assert!(!job.transition(BatchStatus::Running, BatchStatus::Completed));

        let snap = job.snapshot();
        assert_eq!(snap.status, BatchStatus::Cancelled);
        assert!(snap.completed_at.is_some());
    }

    #[test]
    fn first_fault_message_is_kept() {
        let job = JobState::new(&BatchJob {
            id: 1,
            project_id: "p".into(),
            cqs: Selection::All,
            mts: Selection::All,
            force_rerun: false,
            status: BatchStatus::Running,
            counts: BatchCounts::default(),
            error: None,
            created_at: now_utc(),
            completed_at: None,
        });
        job.record_fault("disk full".into());
        job.record_fault("later".into());
        assert!(job.should_stop());
        assert_eq!(job.snapshot().error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn finished_jobs_leave_the_registry() {
        let catalog = StaticCatalog::new();
        catalog.insert_project(
            "p",
            vec![CompetencyQuestion {
                id: "cq1".into(),
                query: "ASK {}".into(),
                ..Default::default()
            }],
            vec![Microtheory {
                id: "mt1".into(),
                data_revision: "1".into(),
                ..Default::default()
            }],
        );
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        let sched = BatchScheduler::new(
            Arc::new(catalog),
            Arc::new(store),
            Arc::new(FakeExecutor::passing(1)),
            SchedulerOptions::default(),
        );

        let job = sched.start_batch(BatchRequest::all("p")).unwrap();
        assert!(sched.lookup(job.id).is_some());

        let done = sched.wait(job.id).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert!(lock(&sched.jobs).is_empty());
        assert_eq!(sched.get_batch_status(job.id).unwrap(), done);
    }
}
