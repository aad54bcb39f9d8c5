//! Text summary builder for CLI output.
//!
//! This module computes timing figures and formats human-readable lines for text mode.

use crate::metrics;
use crate::model::{PipelineOutcome, PipelineReport};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished report.
pub(crate) fn build_text_summary(report: &PipelineReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Source: {}", report.source));
    match report.outcome {
        PipelineOutcome::Completed => lines.push("Pipeline: completed".to_string()),
        PipelineOutcome::Failed { stage: Some(stage) } => {
            lines.push(format!("Pipeline: failed at {stage}"))
        }
        PipelineOutcome::Failed { stage: None } => lines.push("Pipeline: failed".to_string()),
    }

    for entry in &report.entries {
        let mark = if entry.ok { "ok" } else { "FAILED" };
        let stage = entry.stage.map(|s| s.label()).unwrap_or("-");
        match entry.elapsed_ms {
            Some(ms) => lines.push(format!("  [{mark}] {stage:<20} {ms:>6} ms  {}", entry.message)),
            None => lines.push(format!("  [{mark}] {stage:<20} {:>6}     {}", "-", entry.message)),
        }
    }

    if let Some(t) = metrics::stage_timings(&report.entries) {
        lines.push(format!("Total: {} ms (avg {:.1} ms per stage)", t.total_ms, t.mean_ms));
        if let Some((stage, ms)) = t.slowest {
            lines.push(format!("Slowest stage: {stage} ({ms} ms)"));
        }
    }

    TextSummary { lines }
}
