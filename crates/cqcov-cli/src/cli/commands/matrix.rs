use super::{exit_codes, filter, open_workspace};
use crate::cli::args::MatrixArgs;
use cqcov_core::report::{console, json};

pub fn run(args: MatrixArgs) -> anyhow::Result<i32> {
    let scheduler = open_workspace(&args.ws)?;
    let matrix = scheduler.build_matrix(&args.project, filter(&args.cqs), filter(&args.mts))?;

    if args.format == "json" {
        println!("{}", json::to_json_string(&matrix)?);
    } else {
        console::print_matrix(&matrix);
    }
    if let Some(out) = &args.out {
        json::write_json(&matrix, out)?;
        eprintln!("wrote {}", out.display());
    }

    if let Some(min) = args.min_coverage {
        if matrix.summary.coverage_pct < min {
            eprintln!(
                "\n❌ Minimum coverage not met ({:.1}% < {:.1}%)",
                matrix.summary.coverage_pct, min
            );
            return Ok(exit_codes::TEST_FAILED);
        }
    }
    Ok(exit_codes::OK)
}
