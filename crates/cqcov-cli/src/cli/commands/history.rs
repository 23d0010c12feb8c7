use super::{exit_codes, open_workspace};
use crate::cli::args::HistoryArgs;
use cqcov_core::report::console;

pub fn run(args: HistoryArgs) -> anyhow::Result<i32> {
    let scheduler = open_workspace(&args.ws)?;
    let records = scheduler.history(&args.project, &args.cq, &args.mt, args.last)?;

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(exit_codes::OK);
    }

    if records.is_empty() {
        eprintln!("no runs recorded for {} @ {}", args.cq, args.mt);
    } else {
        eprintln!("{} @ {} (newest first)", args.cq, args.mt);
        for r in &records {
            console::print_record(r);
        }
    }
    Ok(exit_codes::OK)
}
