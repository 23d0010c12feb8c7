mod common;

use common::*;
use cqcov_core::errors::{CoverageError, EntityKind};
use cqcov_core::model::{
    now_utc, BatchCounts, BatchJob, BatchRequest, BatchStatus, Outcome, Selection,
};
use cqcov_core::providers::executor::{FakeBehavior, FakeExecutor};
use cqcov_core::storage::{BatchJobStore, RunRecordStore, Store};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn concurrency_never_exceeds_the_cap() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(30)));
    let sched = scheduler(&catalog, store, &exec, options(2));

    let job = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let done = sched.wait(job.id).await.unwrap();

    assert_eq!(done.counts.completed_pairs, 6);
    assert!(exec.max_in_flight() <= 2, "peak {}", exec.max_in_flight());
    assert!(exec.max_in_flight() >= 1);
}

#[tokio::test]
async fn cancellation_stops_dispatch_but_lets_in_flight_pairs_commit() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(50)));
    let sched = scheduler(&catalog, store.clone(), &exec, options(1));

    let job = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let mut rx = sched.subscribe(job.id).unwrap();
    rx.wait_for(|j| j.counts.completed_pairs >= 1).await.unwrap();

    let after_cancel = sched.cancel_batch(job.id).unwrap();
    // Remaining pairs keep the job running until the in-flight one commits.
    assert_eq!(after_cancel.status, BatchStatus::Running);

    let done = sched.wait(job.id).await.unwrap();
    assert_eq!(done.status, BatchStatus::Cancelled);
    assert!(done.counts.completed_pairs < 6);
    // Every dispatched pair committed its record.
    assert_eq!(exec.calls() as u64, done.counts.completed_pairs);
    assert_eq!(
        store.count_run_records(PROJECT).unwrap(),
        done.counts.completed_pairs
    );
}

#[tokio::test]
async fn cancelling_a_queued_job_dispatches_nothing() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1));
    let sched = scheduler(&catalog, store, &exec, options(4));

    // Current-thread runtime: the job task has not been polled yet.
    let job = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let cancelled = sched.cancel_batch(job.id).unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);

    let done = sched.wait(job.id).await.unwrap();
    assert_eq!(done.status, BatchStatus::Cancelled);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(exec.calls(), 0);
}

#[tokio::test]
async fn cancelling_a_terminal_job_is_a_no_op() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1));
    let sched = scheduler(&catalog, store, &exec, options(4));

    let job = sched.start_batch(BatchRequest::all(PROJECT)).unwrap();
    let done = sched.wait(job.id).await.unwrap();
    assert_eq!(done.status, BatchStatus::Completed);

    let again = sched.cancel_batch(job.id).unwrap();
    assert_eq!(again, done);
    assert_eq!(sched.get_batch_status(job.id).unwrap(), done);
}

#[tokio::test]
async fn executor_faults_become_fail_records() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(
        FakeExecutor::passing(1)
            .script(&query("cq1"), "mt1", FakeBehavior::Hang)
            .script(
                &query("cq2"),
                "mt1",
                FakeBehavior::Error("connection refused".into()),
            )
            .script(&query("cq3"), "mt1", FakeBehavior::Panic("boom".into())),
    );
    let mut opts = options(4);
    opts.timeout = Duration::from_millis(100);
    let sched = scheduler(&catalog, store, &exec, opts);

    let job = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let done = sched.wait(job.id).await.unwrap();
    assert_eq!(done.status, BatchStatus::Completed);
    assert_eq!(done.counts.completed_pairs, 6);
    assert_eq!(done.counts.failed_pairs, 3);

    let m = sched.build_matrix(PROJECT, None, None).unwrap();
    assert_eq!(m.cell("cq1", "mt1").unwrap().failure_reason(), Some("timeout"));
    assert_eq!(
        m.cell("cq2", "mt1").unwrap().failure_reason(),
        Some("connection refused")
    );
    assert_eq!(
        m.cell("cq3", "mt1").unwrap().failure_reason(),
        Some("executor panicked: boom")
    );
    assert_eq!(m.cell("cq1", "mt2").unwrap().outcome(), Some(Outcome::Pass));
}

#[tokio::test]
async fn store_failure_fails_the_job_and_halts_dispatch() {
    let catalog = catalog();
    let inner = Store::memory().unwrap();
    inner.init_schema().unwrap();
    let flaky = Arc::new(FlakyStore::new(inner.clone(), 2));
    let exec = Arc::new(FakeExecutor::passing(1));
    let sched = scheduler(&catalog, flaky, &exec, options(1));

    let job = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let done = sched.wait(job.id).await.unwrap();

    assert_eq!(done.status, BatchStatus::Failed);
    assert_eq!(done.counts.completed_pairs, 2);
    assert!(done
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("run record store unavailable"));
    // Third pair ran but could not commit; nothing after it was dispatched.
    assert_eq!(exec.calls(), 3);
    assert_eq!(inner.count_run_records(PROJECT).unwrap(), 2);
}

#[tokio::test]
async fn second_active_batch_for_a_project_conflicts() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(20)));
    let sched = scheduler(&catalog, store, &exec, options(1));

    let first = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let err = sched.start_batch(BatchRequest::all(PROJECT)).unwrap_err();
    assert!(matches!(err, CoverageError::Conflict(_)));

    sched.wait(first.id).await.unwrap();
    assert!(sched.start_batch(BatchRequest::all(PROJECT)).is_ok());
}

#[tokio::test]
async fn conflict_check_can_be_disabled() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(20)));
    let mut opts = options(1);
    opts.single_batch_per_project = false;
    let sched = scheduler(&catalog, store, &exec, opts);

    let a = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let b = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    assert_ne!(a.id, b.id);
    sched.wait(a.id).await.unwrap();
    sched.wait(b.id).await.unwrap();
}

#[tokio::test]
async fn unknown_ids_are_rejected_up_front() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1));
    let sched = scheduler(&catalog, store, &exec, options(1));

    let err = sched.start_batch(BatchRequest::all("ghost")).unwrap_err();
    assert!(matches!(
        err,
        CoverageError::NotFound {
            kind: EntityKind::Project,
            ..
        }
    ));

    let err = sched.get_batch_status(999).unwrap_err();
    assert!(matches!(
        err,
        CoverageError::NotFound {
            kind: EntityKind::BatchJob,
            ..
        }
    ));
    assert!(sched.cancel_batch(999).is_err());
}

#[tokio::test]
async fn progress_is_monotonic_and_job_is_readable_from_another_scheduler() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(5)));
    let sched = scheduler(&catalog, store.clone(), &exec, options(2));

    let job = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let mut rx = sched.subscribe(job.id).unwrap();
    let mut seen = vec![rx.borrow_and_update().counts.completed_pairs];
    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();
        seen.push(snap.counts.completed_pairs);
        if snap.status.is_terminal() {
            break;
        }
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(seen.last(), Some(&6));

    // Fresh registry: status comes from the persisted row.
    let other = scheduler(&catalog, store, &exec, options(2));
    let persisted = other.get_batch_status(job.id).unwrap();
    assert_eq!(persisted.status, BatchStatus::Completed);
    assert_eq!(persisted.counts.completed_pairs, 6);
    assert_eq!(persisted.counts.total_pairs, 6);
    let waited = other.wait(job.id).await.unwrap();
    assert_eq!(waited.status, BatchStatus::Completed);
}

#[tokio::test]
async fn schedulers_sharing_a_database_do_not_run_a_project_twice() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(20)));
    let a = scheduler(&catalog, store.clone(), &exec, options(1));
    let b = scheduler(&catalog, store.clone(), &exec, options(1));

    let first = a
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let err = b
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap_err();
    assert!(matches!(err, CoverageError::Conflict(_)), "{err}");

    a.wait(first.id).await.unwrap();
    assert_eq!(store.count_run_records(PROJECT).unwrap(), 6);

    let second = b
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    b.wait(second.id).await.unwrap();
    assert_eq!(store.count_run_records(PROJECT).unwrap(), 12);
}

#[tokio::test]
async fn job_left_running_by_a_dead_process_expires_with_its_lease() {
    let catalog = catalog();
    let store = store();
    // What a process killed mid-batch leaves behind.
    let orphan = store
        .create_batch_job(&BatchJob {
            id: 0,
            project_id: PROJECT.into(),
            cqs: Selection::All,
            mts: Selection::All,
            force_rerun: true,
            status: BatchStatus::Running,
            counts: BatchCounts {
                total_pairs: 6,
                scheduled_pairs: 6,
                completed_pairs: 2,
                ..Default::default()
            },
            error: None,
            created_at: now_utc(),
            completed_at: None,
        })
        .unwrap();

    let exec = Arc::new(FakeExecutor::passing(1));
    let mut opts = options(2);
    opts.job_lease = Duration::from_millis(100);
    let sched = scheduler(&catalog, store, &exec, opts);

    let err = sched.start_batch(BatchRequest::all(PROJECT)).unwrap_err();
    assert!(matches!(err, CoverageError::Conflict(_)), "{err}");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let job = sched.start_batch(BatchRequest::all(PROJECT)).unwrap();
    assert_eq!(
        sched.wait(job.id).await.unwrap().status,
        BatchStatus::Completed
    );

    let expired = sched.get_batch_status(orphan).unwrap();
    assert_eq!(expired.status, BatchStatus::Failed);
    assert_eq!(expired.counts.completed_pairs, 2);
    assert!(expired
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("abandoned"));
}

#[tokio::test]
async fn stored_progress_advances_while_the_job_runs() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(30)));
    let owner = scheduler(&catalog, store.clone(), &exec, options(1));
    // Sees only what the owner has written to the database.
    let observer = scheduler(&catalog, store, &exec, options(1));

    let job = owner
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let mut rx = owner.subscribe(job.id).unwrap();
    rx.wait_for(|j| j.counts.completed_pairs >= 2).await.unwrap();

    let mid = observer.get_batch_status(job.id).unwrap();
    assert_eq!(mid.status, BatchStatus::Running);
    assert!(mid.counts.completed_pairs >= 2, "{:?}", mid.counts);

    let mut last = mid.counts.completed_pairs;
    loop {
        let seen = observer.get_batch_status(job.id).unwrap();
        assert!(seen.counts.completed_pairs >= last, "{:?}", seen.counts);
        last = seen.counts.completed_pairs;
        if seen.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last, 6);
}

#[tokio::test]
async fn records_carry_the_revision_current_when_each_pair_ran() {
    let catalog = catalog();
    let store = store();
    let exec = Arc::new(FakeExecutor::passing(1).with_delay(Duration::from_millis(30)));
    let sched = scheduler(&catalog, store.clone(), &exec, options(1));

    let job = sched
        .start_batch(BatchRequest::all(PROJECT).forced())
        .unwrap();
    let mut rx = sched.subscribe(job.id).unwrap();
    rx.wait_for(|j| j.counts.completed_pairs >= 1).await.unwrap();
    catalog.set_data_revision(PROJECT, "mt1", "2").unwrap();
    catalog.set_data_revision(PROJECT, "mt2", "2").unwrap();
    sched.wait(job.id).await.unwrap();

    // One pair at a time in CQ-major order: cq1/mt1 ran before the bump, cq3/mt2 after it.
    let before = store.latest_by_pair(PROJECT, "cq1", "mt1").unwrap().unwrap();
    let after = store.latest_by_pair(PROJECT, "cq3", "mt2").unwrap().unwrap();
    assert_eq!(before.data_revision, "1");
    assert_eq!(after.data_revision, "2");

    let m = sched.build_matrix(PROJECT, None, None).unwrap();
    assert!(!m.cell("cq1", "mt1").unwrap().is_fresh_pass("2"));
    assert!(m.cell("cq3", "mt2").unwrap().is_fresh_pass("2"));
}
