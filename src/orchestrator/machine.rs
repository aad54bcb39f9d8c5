//! Stage state machine.
//!
//! Pure transition logic: the caller supplies results and clock readings and
//! acts on the returned [`Directive`]. Nothing here touches channels or tasks,
//! so the async driver and synchronous tests drive the same code.

use crate::model::{
    now_rfc3339, PipelineOutcome, ProgressEntry, Stage, StageRequest, StageResult, StageValue,
    ZeroResultPolicy,
};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelinePhase {
    Idle,
    /// Index into [`Stage::SEQUENCE`] of the outstanding request.
    Running(usize),
    Completed,
    Failed,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Directive {
    Dispatch(StageRequest),
    Terminate(PipelineOutcome),
    Ignore,
}

pub(crate) struct PipelineMachine {
    phase: PipelinePhase,
    started_at: Option<Instant>,
    policy: ZeroResultPolicy,
    log: Vec<ProgressEntry>,
}

impl PipelineMachine {
    pub fn new(policy: ZeroResultPolicy) -> Self {
        Self {
            phase: PipelinePhase::Idle,
            started_at: None,
            policy,
            log: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, PipelinePhase::Completed | PipelinePhase::Failed)
    }

    pub fn current_stage(&self) -> Option<Stage> {
        match self.phase {
            PipelinePhase::Running(i) => Stage::SEQUENCE.get(i).copied(),
            _ => None,
        }
    }

    pub fn entries(&self) -> &[ProgressEntry] {
        &self.log
    }

    pub fn into_entries(self) -> Vec<ProgressEntry> {
        self.log
    }

    /// Outcome so far; a machine that never reached `Completed` counts as failed.
    pub fn outcome(&self) -> PipelineOutcome {
        match self.phase {
            PipelinePhase::Completed => PipelineOutcome::Completed,
            _ => PipelineOutcome::Failed {
                stage: self.failed_stage(),
            },
        }
    }

    /// Leave `Idle` by requesting the first stage.
    pub fn start(&mut self, now: Instant) -> Directive {
        if self.phase != PipelinePhase::Idle {
            return Directive::Ignore;
        }
        self.dispatch(0, now)
    }

    /// Single transition function: consume the result for the outstanding stage.
    pub fn on_result(&mut self, result: StageResult, now: Instant) -> Directive {
        let PipelinePhase::Running(index) = self.phase else {
            tracing::debug!(op = result.op.tag(), "ignoring result outside a running pipeline");
            return Directive::Ignore;
        };
        let expected = Stage::SEQUENCE[index];
        let elapsed_ms = self.elapsed_ms(now);

        let Some(stage) = result.op.stage() else {
            let message = match result.outcome {
                Err(e) => format!("Worker failed: unrecognized reply '{}' ({e})", result.op.tag()),
                Ok(_) => format!("Worker failed: unrecognized reply '{}'", result.op.tag()),
            };
            return self.fail(expected, message, None);
        };
        if stage != expected {
            return self.fail(
                expected,
                format!(
                    "Worker failed: expected reply to '{}', got '{}'",
                    expected.tag(),
                    stage.tag()
                ),
                None,
            );
        }

        let value = match result.outcome {
            Err(error) => {
                return self.fail(stage, format!("{stage} failed: {error}"), Some(elapsed_ms));
            }
            Ok(value) => value,
        };
        if let Err(reason) = self.accept(stage, value) {
            return self.fail(stage, format!("{stage} failed: {reason}"), Some(elapsed_ms));
        }

        self.push(ProgressEntry {
            timestamp_utc: now_rfc3339(),
            stage: Some(stage),
            message: success_message(stage, value),
            elapsed_ms: Some(elapsed_ms),
            ok: true,
            value,
        });

        if index + 1 < Stage::SEQUENCE.len() {
            self.dispatch(index + 1, now)
        } else {
            self.phase = PipelinePhase::Completed;
            self.started_at = None;
            Directive::Terminate(PipelineOutcome::Completed)
        }
    }

    /// The result channel closed before the outstanding stage was answered.
    pub fn on_worker_lost(&mut self, now: Instant) -> Directive {
        let Some(stage) = self.current_stage() else {
            return Directive::Ignore;
        };
        let elapsed_ms = self.elapsed_ms(now);
        self.fail(
            stage,
            format!("Worker failed: worker exited before answering '{}'", stage.tag()),
            Some(elapsed_ms),
        )
    }

    /// The run was cancelled while a stage was outstanding.
    pub fn on_cancel(&mut self, now: Instant) -> Directive {
        let Some(stage) = self.current_stage() else {
            return Directive::Ignore;
        };
        let elapsed_ms = self.elapsed_ms(now);
        self.fail(
            stage,
            format!("Cancelled while waiting for '{}'", stage.tag()),
            Some(elapsed_ms),
        )
    }

    fn accept(&self, stage: Stage, value: Option<StageValue>) -> Result<(), String> {
        match (stage, value) {
            (Stage::Initialize, _) => Ok(()),
            (_, None) => Err("worker returned no result".into()),
            (_, Some(v)) if v.is_zero() && self.policy == ZeroResultPolicy::Reject => {
                Err(format!("empty result ({v})"))
            }
            (_, Some(_)) => Ok(()),
        }
    }

    fn dispatch(&mut self, index: usize, now: Instant) -> Directive {
        let stage = Stage::SEQUENCE[index];
        self.phase = PipelinePhase::Running(index);
        self.started_at = Some(now);
        Directive::Dispatch(StageRequest::Run(stage))
    }

    fn fail(&mut self, stage: Stage, message: String, elapsed_ms: Option<u64>) -> Directive {
        self.push(ProgressEntry {
            timestamp_utc: now_rfc3339(),
            stage: Some(stage),
            message,
            elapsed_ms,
            ok: false,
            value: None,
        });
        self.phase = PipelinePhase::Failed;
        self.started_at = None;
        Directive::Terminate(PipelineOutcome::Failed { stage: Some(stage) })
    }

    fn push(&mut self, entry: ProgressEntry) {
        tracing::info!(
            stage = ?entry.stage,
            ok = entry.ok,
            elapsed_ms = ?entry.elapsed_ms,
            "{}",
            entry.message
        );
        self.log.push(entry);
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        self.started_at
            .map(|t| now.saturating_duration_since(t).as_millis() as u64)
            .unwrap_or(0)
    }

    fn failed_stage(&self) -> Option<Stage> {
        self.current_stage()
            .or_else(|| self.log.last().and_then(|e| e.stage))
    }
}

fn success_message(stage: Stage, value: Option<StageValue>) -> String {
    match (stage, value) {
        (Stage::Initialize, _) => "Loaded compute module".to_string(),
        (Stage::Fetch, Some(v)) => format!("Successfully fetched data: {v}"),
        (_, Some(v)) => format!("{stage} done: {v}"),
        (_, None) => format!("{stage} done"),
    }
}
