use super::exit_codes;
use crate::cli::args::InitArgs;

pub fn run(args: InitArgs) -> anyhow::Result<i32> {
    let path = &args.config;
    if path.exists() {
        eprintln!("note: {} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    cqcov_core::config::write_sample_config(path)?;
    eprintln!("created {}", path.display());
    Ok(exit_codes::OK)
}
