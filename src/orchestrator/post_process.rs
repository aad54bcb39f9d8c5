//! Post-run processing utilities.
//!
//! Handles exports after a run finishes.

use crate::cli::Cli;
use crate::model::PipelineReport;
use crate::storage;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub export_messages: Vec<String>,
}

/// Process a finished run: write the requested exports and describe what happened.
pub(crate) fn process_run_completion(args: &Cli, report: &PipelineReport) -> ProcessedRun {
    let mut export_messages = Vec::new();
    if let Some(export_path) = args.export_json.as_deref() {
        match storage::export_json(export_path, report) {
            Ok(_) => export_messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedRun { export_messages }
}
