use super::args::*;
use anyhow::Context;
use cqcov_core::catalog::StaticCatalog;
use cqcov_core::config::{load_config, ExecutorConfig, WorkspaceConfig};
use cqcov_core::engine::{BatchScheduler, SchedulerOptions};
use cqcov_core::errors::CoverageError;
use cqcov_core::model::{ExecOutcome, Outcome};
use cqcov_core::providers::executor::{
    FakeBehavior, FakeExecutor, QueryExecutor, ReplayExecutor, SparqlExecutor,
};
use cqcov_core::storage::Store;
use std::path::Path;
use std::sync::Arc;

pub mod batch;
pub mod history;
pub mod init;
pub mod matrix;
pub mod run_pair;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const TEST_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let result = match cli.cmd {
        Command::Init(args) => init::run(args),
        Command::Matrix(args) => matrix::run(args),
        Command::Batch(args) => match args.cmd {
            BatchSub::Run(run_args) => batch::cmd_run(run_args).await,
            BatchSub::Status(status_args) => batch::cmd_status(status_args),
        },
        Command::RunPair(args) => run_pair::run(args).await,
        Command::History(args) => history::run(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    };

    // Bad ids, conflicts and config problems are usage errors, not crashes.
    match result {
        Err(e) => match e.downcast_ref::<CoverageError>() {
            Some(ce) if ce.is_request_error() => {
                eprintln!("error: {}", ce);
                Ok(exit_codes::CONFIG_ERROR)
            }
            _ => Err(e),
        },
        ok => ok,
    }
}

/// Loads config, opens the database and wires the scheduler for one workspace.
pub(crate) fn open_workspace(args: &WorkspaceArgs) -> anyhow::Result<BatchScheduler> {
    let config = load_config(&args.config, args.strict)?;
    let store = open_store(&args.db)?;
    let catalog = Arc::new(StaticCatalog::from_config(&config));
    let executor = build_executor(&config)?;
    let options = SchedulerOptions::from(&config.settings);

    tracing::debug!(
        event = "cqcov.workspace.opened",
        config = %args.config.display(),
        db = %args.db.display(),
        provider = executor.provider_name(),
        parallel = options.parallel,
        "workspace opened"
    );

    Ok(BatchScheduler::new(catalog, store, executor, options))
}

pub(crate) fn open_store(db: &Path) -> anyhow::Result<Arc<Store>> {
    ensure_parent_dir(db)?;
    let store =
        Store::open(db).with_context(|| format!("failed to open database {}", db.display()))?;
    store.init_schema()?;
    Ok(Arc::new(store))
}

fn build_executor(config: &WorkspaceConfig) -> anyhow::Result<Arc<dyn QueryExecutor>> {
    let executor: Arc<dyn QueryExecutor> = match &config.executor {
        Some(ExecutorConfig::Sparql { endpoint }) => Arc::new(SparqlExecutor::new(endpoint)),
        Some(ExecutorConfig::Replay { file }) => {
            let cqs = config
                .projects
                .iter()
                .flat_map(|p| p.cqs.iter().map(move |cq| (p.id.as_str(), cq)));
            Arc::new(ReplayExecutor::from_path(file, cqs)?)
        }
        Some(ExecutorConfig::Fake { outcome, row_count }) => {
            let result = match outcome {
                Outcome::Pass => ExecOutcome::pass(*row_count),
                Outcome::Fail => ExecOutcome::fail("fake executor configured to fail"),
            };
            Arc::new(FakeExecutor::new(FakeBehavior::Outcome(result)))
        }
        None => {
            tracing::warn!(
                event = "cqcov.executor.defaulted",
                "no executor configured; every pair will pass"
            );
            Arc::new(FakeExecutor::passing(0))
        }
    };
    Ok(executor)
}

/// `None` for an empty filter, i.e. "everything".
pub(crate) fn filter(ids: &[String]) -> Option<&[String]> {
    (!ids.is_empty()).then_some(ids)
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
