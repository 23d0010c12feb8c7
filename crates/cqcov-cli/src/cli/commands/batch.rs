use super::{exit_codes, filter, open_store, open_workspace};
use crate::cli::args::{BatchRunArgs, BatchStatusArgs};
use cqcov_core::errors::{CoverageError, EntityKind};
use cqcov_core::model::{BatchJob, BatchRequest, BatchStatus, Selection};
use cqcov_core::report::console;
use cqcov_core::storage::BatchJobStore;

pub async fn cmd_run(args: BatchRunArgs) -> anyhow::Result<i32> {
    let scheduler = open_workspace(&args.ws)?;
    let request = BatchRequest {
        project_id: args.project.clone(),
        cqs: Selection::from_filter(filter(&args.cqs)),
        mts: Selection::from_filter(filter(&args.mts)),
        force_rerun: args.force,
    };

    let job = scheduler.start_batch(request)?;
    eprintln!(
        "started batch #{} for '{}': {} of {} pairs scheduled, {} up to date",
        job.id,
        job.project_id,
        job.counts.scheduled_pairs,
        job.counts.total_pairs,
        job.counts.skipped_pairs
    );

    let canceller = {
        let scheduler = scheduler.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ncancelling batch #{job_id}; waiting for in-flight pairs...");
                if let Err(e) = scheduler.cancel_batch(job_id) {
                    tracing::warn!(event = "cqcov.batch.cancel_failed", job_id, error = %e);
                }
            }
        })
    };

    let mut rx = scheduler.subscribe(job.id)?;
    let mut last_completed = None;
    let done = loop {
        let snapshot = rx.borrow_and_update().clone();
        if last_completed != Some(snapshot.counts.completed_pairs) {
            last_completed = Some(snapshot.counts.completed_pairs);
            eprintln!("  {}", console::progress_line(&snapshot));
        }
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        if rx.changed().await.is_err() {
            break scheduler.get_batch_status(job.id)?;
        }
    };
    canceller.abort();

    report(&done, &args.format)?;
    Ok(match done.status {
        BatchStatus::Completed => exit_codes::OK,
        _ => exit_codes::TEST_FAILED,
    })
}

pub fn cmd_status(args: BatchStatusArgs) -> anyhow::Result<i32> {
    let store = open_store(&args.db)?;
    let job = store
        .get_batch_job(args.job_id)?
        .ok_or_else(|| CoverageError::not_found(EntityKind::BatchJob, args.job_id.to_string()))?;
    report(&job, &args.format)?;
    Ok(exit_codes::OK)
}

fn report(job: &BatchJob, format: &str) -> anyhow::Result<()> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(job)?);
    } else {
        console::print_batch(job);
    }
    Ok(())
}
