//! JSON persistence of run reports.

use crate::model::PipelineReport;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Write `report` as pretty JSON to `path`, creating parent directories.
pub fn export_json(path: &Path, report: &PipelineReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("serialize report")?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// File name used when saving a report without an explicit path.
pub fn default_report_path(report: &PipelineReport) -> PathBuf {
    let stamp: String = report
        .started_utc
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    PathBuf::from(format!("pipeline-{stamp}.json"))
}
