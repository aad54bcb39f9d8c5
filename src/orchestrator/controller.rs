//! Run lifecycle controller.
//!
//! Drives a single pipeline against a spawned worker, and owns the
//! start/restart/quit lifecycle on behalf of presentation layers.

use super::machine::{Directive, PipelineMachine};
use crate::cli::{build_config, Cli};
use crate::compute::{ModuleLoader, TableLoader};
use crate::model::{now_rfc3339, PipelineEvent, PipelineReport, RunConfig, ZeroResultPolicy};
use crate::worker;
use anyhow::Result;
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Commands emitted by UI layers to control the running pipeline.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Restart,
    Quit,
}

/// Run every stage on a fresh worker and return the finished report.
///
/// Exactly one request is outstanding at any time: the next request is only
/// sent after the previous result has been consumed by the state machine.
/// The worker is terminated once, on the first terminal transition. If
/// `cancel` resolves while a stage is outstanding the run fails at that stage.
pub(crate) async fn run_pipeline<L, C>(
    loader: L,
    policy: ZeroResultPolicy,
    source: String,
    event_tx: &UnboundedSender<PipelineEvent>,
    cancel: C,
) -> PipelineReport
where
    L: ModuleLoader,
    C: Future<Output = ()>,
{
    let started_utc = now_rfc3339();
    let mut worker = worker::spawn(loader);
    let mut machine = PipelineMachine::new(policy);
    let mut directive = machine.start(Instant::now());
    let mut emitted = 0usize;
    tokio::pin!(cancel);

    let outcome = loop {
        for entry in &machine.entries()[emitted..] {
            let _ = event_tx.send(PipelineEvent::Progress(entry.clone()));
        }
        emitted = machine.entries().len();

        let request = match directive {
            Directive::Dispatch(request) => request,
            Directive::Terminate(outcome) => break outcome,
            Directive::Ignore => break machine.outcome(),
        };

        if let Some(stage) = request.stage() {
            let _ = event_tx.send(PipelineEvent::StageStarted { stage });
        }
        tracing::debug!(op = request.tag(), "dispatching stage");

        directive = if worker.send(request) {
            tokio::select! {
                reply = worker.recv() => match reply {
                    Some(result) => machine.on_result(result, Instant::now()),
                    None => machine.on_worker_lost(Instant::now()),
                },
                () = &mut cancel => {
                    tracing::info!("pipeline cancelled");
                    machine.on_cancel(Instant::now())
                }
            }
        } else {
            machine.on_worker_lost(Instant::now())
        };
    };

    debug_assert!(machine.is_terminal());
    worker.terminate().await;
    tracing::info!(?outcome, "pipeline finished");

    PipelineReport {
        started_utc,
        source,
        outcome,
        entries: machine.into_entries(),
    }
}

/// Run the pipeline described by `cfg` with the built-in table module.
pub(crate) async fn run_configured(
    cfg: &RunConfig,
    event_tx: &UnboundedSender<PipelineEvent>,
) -> PipelineReport {
    run_pipeline(
        TableLoader::new(cfg),
        cfg.zero_policy,
        cfg.source.to_string(),
        event_tx,
        futures::future::pending(),
    )
    .await
}

/// Internal handle for a running pipeline task.
struct RunCtx {
    cancel: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<PipelineReport>>,
}

/// Spawn a new pipeline run and return its handle.
fn start_run<L: ModuleLoader>(
    loader: L,
    cfg: &RunConfig,
    event_tx: UnboundedSender<PipelineEvent>,
) -> RunCtx {
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let policy = cfg.zero_policy;
    let source = cfg.source.to_string();
    let handle = tokio::spawn(async move {
        let cancelled = async move {
            let _ = cancel_rx.await;
        };
        run_pipeline(loader, policy, source, &event_tx, cancelled).await
    });
    RunCtx {
        cancel: Some(cancel_tx),
        handle: Some(handle),
    }
}

/// Stop a run and wait until its worker has been terminated.
async fn cancel_run(mut ctx: RunCtx) {
    if let Some(cancel) = ctx.cancel.take() {
        let _ = cancel.send(());
    }
    if let Some(handle) = ctx.handle.take() {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "cancelled pipeline task did not finish cleanly");
        }
    }
}

/// Orchestrate pipeline runs based on UI commands and emit events back to presentation layers.
pub(crate) async fn run_controller(
    args: &Cli,
    event_tx: UnboundedSender<PipelineEvent>,
    cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let cfg = build_config(args);
    drive_runs(&cfg, args.run_on_launch, TableLoader::new, event_tx, cmd_rx).await
}

async fn drive_runs<L, F>(
    cfg: &RunConfig,
    run_on_launch: bool,
    mut make_loader: F,
    event_tx: UnboundedSender<PipelineEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()>
where
    L: ModuleLoader,
    F: FnMut(&RunConfig) -> L,
{
    let mut run_ctx = if run_on_launch {
        Some(start_run(make_loader(cfg), cfg, event_tx.clone()))
    } else {
        None
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Restart) => {
                        // The old worker is gone before the next loader is built.
                        if let Some(ctx) = run_ctx.take() {
                            cancel_run(ctx).await;
                            let _ = event_tx.send(PipelineEvent::Info(
                                "Cancelled running pipeline".into(),
                            ));
                        }
                        let _ = event_tx.send(PipelineEvent::Info("Restarting…".into()));
                        run_ctx = Some(start_run(make_loader(cfg), cfg, event_tx.clone()));
                    }
                    Some(UiCommand::Quit) | None => {
                        if let Some(ctx) = run_ctx.take() {
                            cancel_run(ctx).await;
                        }
                        return Ok(());
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    run_ctx = None;
                    match join_res {
                        Ok(report) => {
                            let _ = event_tx.send(PipelineEvent::Finished { report: Box::new(report) });
                        }
                        Err(e) => {
                            let _ = event_tx.send(PipelineEvent::Info(format!(
                                "Pipeline task failed: {e}"
                            )));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSource, PipelineOutcome, Stage, StageValue};
    use crate::testing::{Script, ScriptedLoader, Tally};
    use crate::worker::Executor;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn run_script(
        script: Script,
        policy: ZeroResultPolicy,
    ) -> (PipelineReport, Vec<PipelineEvent>, usize) {
        let (loader, tally) = ScriptedLoader::new(script);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = run_pipeline(
            loader,
            policy,
            "scripted".into(),
            &tx,
            futures::future::pending(),
        )
        .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (report, events, tally.dropped())
    }

    #[tokio::test]
    async fn completes_all_stages_in_order() {
        let (report, events, dropped) =
            run_script(Script::default(), ZeroResultPolicy::Reject).await;

        assert_eq!(report.outcome, PipelineOutcome::Completed);
        assert_eq!(report.entries.len(), 4);
        let values: Vec<_> = report.entries.iter().map(|e| e.value).collect();
        assert_eq!(
            values,
            vec![
                None,
                Some(StageValue::Rows(250)),
                Some(StageValue::Aggregate(1000)),
                Some(StageValue::Aggregate(500)),
            ]
        );
        assert!(report.entries.iter().all(|e| e.elapsed_ms.is_some()));
        assert_eq!(dropped, 1, "worker must be terminated exactly once");

        let started: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageStarted { stage } => Some(*stage),
                _ => None,
            })
            .collect();
        assert_eq!(started, Stage::SEQUENCE.to_vec());
        let progress = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::Progress(_)))
            .count();
        assert_eq!(progress, 4);
    }

    #[tokio::test]
    async fn zero_rows_stops_after_fetch() {
        let script = Script {
            rows: Ok(0),
            ..Script::default()
        };
        let (report, _, dropped) = run_script(script, ZeroResultPolicy::Reject).await;
        assert_eq!(
            report.outcome,
            PipelineOutcome::Failed {
                stage: Some(Stage::Fetch)
            }
        );
        assert_eq!(report.entries.len(), 2);
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn load_failure_halts_at_first_stage() {
        let script = Script {
            load: Err("module not found".into()),
            ..Script::default()
        };
        let (report, _, _) = run_script(script, ZeroResultPolicy::Reject).await;
        assert_eq!(
            report.outcome,
            PipelineOutcome::Failed {
                stage: Some(Stage::Initialize)
            }
        );
        assert_eq!(report.entries.len(), 1);
        assert!(report.entries[0].message.contains("module not found"));
    }

    #[tokio::test]
    async fn slow_fetch_is_awaited() {
        let script = Script {
            fetch_delay: Duration::from_millis(30),
            ..Script::default()
        };
        let (report, _, _) = run_script(script, ZeroResultPolicy::Reject).await;
        assert!(report.is_completed());
        assert!(report.entries[1].elapsed_ms.unwrap_or(0) >= 30);
    }

    #[tokio::test]
    async fn fresh_runs_produce_isomorphic_logs() {
        let shape = |r: &PipelineReport| {
            r.entries
                .iter()
                .map(|e| (e.stage, e.ok, e.value, e.message.clone()))
                .collect::<Vec<_>>()
        };
        let (a, _, _) = run_script(Script::default(), ZeroResultPolicy::Reject).await;
        let (b, _, _) = run_script(Script::default(), ZeroResultPolicy::Reject).await;
        assert_eq!(shape(&a), shape(&b));
        assert_eq!(a.outcome, b.outcome);
    }

    /// Drive the state machine and executor synchronously, recording channel traffic.
    #[tokio::test]
    async fn never_more_than_one_request_in_flight() {
        let (loader, _) = ScriptedLoader::new(Script::default());
        let mut executor = Executor::new(loader);
        let mut machine = PipelineMachine::new(ZeroResultPolicy::Reject);
        let mut trace: Vec<String> = Vec::new();

        let mut directive = machine.start(Instant::now());
        while let Directive::Dispatch(request) = directive {
            trace.push(format!("send {}", request.tag()));
            let result = executor.handle(request).await;
            trace.push(format!("recv {}", result.op.tag()));
            directive = machine.on_result(result, Instant::now());
        }

        assert_eq!(directive, Directive::Terminate(PipelineOutcome::Completed));
        assert_eq!(trace.len(), 8);
        for pair in trace.chunks(2) {
            let sent = pair[0].strip_prefix("send ").unwrap();
            let received = pair[1].strip_prefix("recv ").unwrap();
            assert_eq!(sent, received);
        }
    }

    #[tokio::test]
    async fn unknown_command_reply_fails_controller() {
        let (loader, _) = ScriptedLoader::new(Script::default());
        let mut executor = Executor::new(loader);
        let reply = executor.handle("aggregate3".into()).await;
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({ "op": "aggregate3", "error": "Unknown command" })
        );

        let mut machine = PipelineMachine::new(ZeroResultPolicy::Reject);
        machine.start(Instant::now());
        let directive = machine.on_result(reply, Instant::now());
        assert!(matches!(
            directive,
            Directive::Terminate(PipelineOutcome::Failed { .. })
        ));
        assert!(machine.is_terminal());
    }

    fn lifecycle_config() -> RunConfig {
        RunConfig {
            source: DataSource::Builtin,
            fetch_timeout: Duration::from_secs(1),
            zero_policy: ZeroResultPolicy::Reject,
            user_agent: "test".into(),
        }
    }

    /// Each spawned loader with the number of modules already dropped when it was built.
    type Spawned = Arc<Mutex<Vec<(Arc<Tally>, usize)>>>;

    /// Hands out loaders for `scripts` in order, reusing the last one.
    fn scripted_loaders(
        scripts: Vec<Script>,
        spawned: Spawned,
    ) -> impl FnMut(&RunConfig) -> ScriptedLoader + Send + 'static {
        move |_: &RunConfig| {
            let mut spawned = spawned.lock().unwrap();
            let script = scripts
                .get(spawned.len())
                .or(scripts.last())
                .cloned()
                .unwrap_or_default();
            let dropped_so_far: usize = spawned.iter().map(|(p, _)| p.dropped()).sum();
            let (loader, tally) = ScriptedLoader::new(script);
            spawned.push((tally, dropped_so_far));
            loader
        }
    }

    /// Collect events up to and including the first one matching `done`.
    async fn events_until(
        rx: &mut UnboundedReceiver<PipelineEvent>,
        done: impl Fn(&PipelineEvent) -> bool,
    ) -> Vec<PipelineEvent> {
        let collect = async {
            let mut events = Vec::new();
            while let Some(ev) = rx.recv().await {
                let stop = done(&ev);
                events.push(ev);
                if stop {
                    break;
                }
            }
            events
        };
        tokio::time::timeout(Duration::from_secs(3), collect)
            .await
            .expect("controller event timed out")
    }

    fn is_finished(ev: &PipelineEvent) -> bool {
        matches!(ev, PipelineEvent::Finished { .. })
    }

    fn is_fetch_started(ev: &PipelineEvent) -> bool {
        matches!(
            ev,
            PipelineEvent::StageStarted {
                stage: Stage::Fetch
            }
        )
    }

    fn slow_fetch() -> Script {
        Script {
            fetch_delay: Duration::from_secs(30),
            ..Script::default()
        }
    }

    #[tokio::test]
    async fn run_on_launch_finishes_exactly_once() {
        let spawned = Spawned::default();
        let loaders = scripted_loaders(vec![Script::default()], spawned.clone());
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(async move {
            drive_runs(&lifecycle_config(), true, loaders, evt_tx, cmd_rx).await
        });

        let events = events_until(&mut evt_rx, is_finished).await;
        let Some(PipelineEvent::Finished { report }) = events.last() else {
            panic!("no finished event");
        };
        assert!(report.is_completed());
        assert_eq!(report.entries.len(), 4);

        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();
        let mut late_finishes = 0;
        while let Some(ev) = evt_rx.recv().await {
            if is_finished(&ev) {
                late_finishes += 1;
            }
        }
        assert_eq!(late_finishes, 0);

        let spawned = spawned.lock().unwrap();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].0.dropped(), 1);
    }

    #[tokio::test]
    async fn idle_until_restart_when_not_launched() {
        let spawned = Spawned::default();
        let loaders = scripted_loaders(vec![Script::default()], spawned.clone());
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(async move {
            drive_runs(&lifecycle_config(), false, loaders, evt_tx, cmd_rx).await
        });

        tokio::task::yield_now().await;
        assert!(spawned.lock().unwrap().is_empty());

        cmd_tx.send(UiCommand::Restart).unwrap();
        let events = events_until(&mut evt_rx, is_finished).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Info(m) if m.starts_with("Cancelled"))));

        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();
        assert_eq!(spawned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_tears_down_the_slow_run_before_starting_again() {
        let spawned = Spawned::default();
        let loaders = scripted_loaders(vec![slow_fetch(), Script::default()], spawned.clone());
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(async move {
            drive_runs(&lifecycle_config(), true, loaders, evt_tx, cmd_rx).await
        });

        events_until(&mut evt_rx, is_fetch_started).await;
        cmd_tx.send(UiCommand::Restart).unwrap();
        let events = events_until(&mut evt_rx, is_finished).await;

        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::Progress(entry) if !entry.ok && entry.message.starts_with("Cancelled")
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Info(m) if m == "Cancelled running pipeline")));
        assert_eq!(events.iter().filter(|e| is_finished(e)).count(), 1);
        let Some(PipelineEvent::Finished { report }) = events.last() else {
            panic!("no finished event");
        };
        assert!(report.is_completed());

        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();

        let spawned = spawned.lock().unwrap();
        assert_eq!(spawned.len(), 2);
        assert_eq!(spawned[0].0.dropped(), 1);
        assert_eq!(spawned[1].1, 1, "old module must be dropped before the next run starts");
        assert_eq!(spawned[1].0.dropped(), 1);
    }

    #[tokio::test]
    async fn quit_terminates_the_running_worker() {
        let spawned = Spawned::default();
        let loaders = scripted_loaders(vec![slow_fetch()], spawned.clone());
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(async move {
            drive_runs(&lifecycle_config(), true, loaders, evt_tx, cmd_rx).await
        });

        events_until(&mut evt_rx, is_fetch_started).await;
        cmd_tx.send(UiCommand::Quit).unwrap();
        tokio::time::timeout(Duration::from_secs(3), controller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(spawned.lock().unwrap()[0].0.dropped(), 1);
    }

    #[tokio::test]
    async fn closed_command_channel_stops_the_controller() {
        let spawned = Spawned::default();
        let loaders = scripted_loaders(vec![slow_fetch()], spawned.clone());
        let (evt_tx, mut evt_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
        let controller = tokio::spawn(async move {
            drive_runs(&lifecycle_config(), true, loaders, evt_tx, cmd_rx).await
        });

        events_until(&mut evt_rx, is_fetch_started).await;
        drop(cmd_tx);
        tokio::time::timeout(Duration::from_secs(3), controller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(spawned.lock().unwrap()[0].0.dropped(), 1);
    }
}
