use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cqcov",
    version,
    about = "Coverage matrix and batch runner for competency questions"
)]
pub struct Cli {
    /// Log output: text | json (filter via CQCOV_LOG)
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a sample workspace config
    Init(InitArgs),
    /// Show the latest outcome of every (CQ, MT) pair
    Matrix(MatrixArgs),
    /// Start or inspect batch executions
    Batch(BatchArgs),
    /// Execute a single (CQ, MT) pair now
    RunPair(RunPairArgs),
    /// List recorded runs of a pair, newest first
    History(HistoryArgs),
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct WorkspaceArgs {
    #[arg(long, default_value = "cqcov.yaml")]
    pub config: PathBuf,

    #[arg(long, env = "CQCOV_DB", default_value = ".cqcov/cqcov.db")]
    pub db: PathBuf,

    /// Reject unknown config keys instead of warning
    #[arg(long)]
    pub strict: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "cqcov.yaml")]
    pub config: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MatrixArgs {
    #[command(flatten)]
    pub ws: WorkspaceArgs,

    #[arg(long)]
    pub project: String,

    /// Restrict to these CQ ids (repeatable)
    #[arg(long = "cq")]
    pub cqs: Vec<String>,

    /// Restrict to these MT ids (repeatable)
    #[arg(long = "mt")]
    pub mts: Vec<String>,

    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub format: String,

    /// Also write the JSON report here
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Exit 1 when coverage (percent of pairs with a run) is below this
    #[arg(long)]
    pub min_coverage: Option<f64>,
}

#[derive(Parser, Clone)]
pub struct BatchArgs {
    #[command(subcommand)]
    pub cmd: BatchSub,
}

#[derive(Subcommand, Clone)]
pub enum BatchSub {
    /// Run stale, failed and never-run pairs; Ctrl-C cancels
    Run(BatchRunArgs),
    /// Show a persisted batch job
    Status(BatchStatusArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct BatchRunArgs {
    #[command(flatten)]
    pub ws: WorkspaceArgs,

    #[arg(long)]
    pub project: String,

    #[arg(long = "cq")]
    pub cqs: Vec<String>,

    #[arg(long = "mt")]
    pub mts: Vec<String>,

    /// Re-execute pairs that already pass at the current data revision
    #[arg(long)]
    pub force: bool,

    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub format: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BatchStatusArgs {
    #[arg(long, env = "CQCOV_DB", default_value = ".cqcov/cqcov.db")]
    pub db: PathBuf,

    pub job_id: i64,

    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub format: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunPairArgs {
    #[command(flatten)]
    pub ws: WorkspaceArgs,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub cq: String,

    #[arg(long)]
    pub mt: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub ws: WorkspaceArgs,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub cq: String,

    #[arg(long)]
    pub mt: String,

    /// Number of most recent runs to show
    #[arg(long, default_value_t = 20)]
    pub last: u32,

    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub format: String,
}
