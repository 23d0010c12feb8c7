use super::{exit_codes, open_workspace};
use crate::cli::args::RunPairArgs;
use cqcov_core::model::Outcome;
use cqcov_core::report::console;

pub async fn run(args: RunPairArgs) -> anyhow::Result<i32> {
    let scheduler = open_workspace(&args.ws)?;
    let record = scheduler
        .execute_pair(&args.project, &args.cq, &args.mt)
        .await?;

    eprintln!("{} @ {}", record.cq_id, record.mt_id);
    console::print_record(&record);

    Ok(match record.outcome {
        Outcome::Pass => exit_codes::OK,
        Outcome::Fail => exit_codes::TEST_FAILED,
    })
}
