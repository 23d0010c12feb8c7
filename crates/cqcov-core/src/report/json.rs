use crate::model::CoverageMatrix;
use std::path::Path;

pub fn to_json_string(matrix: &CoverageMatrix) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(matrix)?)
}

pub fn write_json(matrix: &CoverageMatrix, out: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(out, to_json_string(matrix)?)?;
    Ok(())
}
