use std::fs;
use std::path::Path;

use selfcal_types::RunSummary;
use tracing::info;

use crate::error::WorkspaceError;

pub const SUMMARY_FILE_NAME: &str = "run_summary.json";

/// Write `summary` as pretty-printed JSON.
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), WorkspaceError> {
    let json = serde_json::to_string_pretty(summary).map_err(|e| WorkspaceError::Write {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    fs::write(path, json).map_err(|source| WorkspaceError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Wrote run summary");
    Ok(())
}

pub fn read_summary(path: &Path) -> anyhow::Result<RunSummary> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
