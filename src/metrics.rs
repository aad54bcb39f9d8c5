use crate::model::{ProgressEntry, Stage};

/// Timing figures derived from a progress log.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTimings {
    pub total_ms: u64,
    pub mean_ms: f64,
    pub slowest: Option<(Stage, u64)>,
}

/// Compute total, mean and slowest stage over the entries that carry a stage and elapsed time.
pub fn stage_timings(entries: &[ProgressEntry]) -> Option<StageTimings> {
    let timed: Vec<(Stage, u64)> = entries
        .iter()
        .filter_map(|e| Some((e.stage?, e.elapsed_ms?)))
        .collect();
    if timed.is_empty() {
        return None;
    }
    let total_ms: u64 = timed.iter().map(|(_, ms)| *ms).sum();
    let mean_ms = total_ms as f64 / timed.len() as f64;
    // Ties resolve to the earliest stage.
    let slowest = timed
        .iter()
        .copied()
        .fold(None, |best: Option<(Stage, u64)>, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        });
    Some(StageTimings {
        total_ms,
        mean_ms,
        slowest,
    })
}
