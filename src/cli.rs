use crate::model::{
    DataSource, PipelineEvent, PipelineOutcome, PipelineReport, RunConfig, ZeroResultPolicy,
};
use crate::orchestrator;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "aggregate-pipeline",
    version,
    about = "Run the load/fetch/aggregate pipeline on a background worker with live progress"
)]
pub struct Cli {
    /// Data source: `builtin`, a path to an Arrow IPC stream (or a `.json` table),
    /// or an http(s) URL serving one
    #[arg(long, default_value = "builtin")]
    pub source: DataSource,

    /// Timeout for fetching data over HTTP
    #[arg(long, default_value = "10s")]
    pub fetch_timeout: humantime::Duration,

    /// Treat a zero row count or zero aggregate as a valid result instead of a failure
    #[arg(long)]
    pub accept_zero: bool,

    /// Print JSON report and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print text progress and summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Export the report as JSON
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,

    /// Automatically start the pipeline when the TUI launches
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub run_on_launch: bool,

    /// Log filter used when RUST_LOG is not set (e.g. warn, info, aggregate_pipeline=debug)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

impl Cli {
    pub fn is_interactive(&self) -> bool {
        !(self.silent || self.json || self.text)
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    // Silent mode takes precedence over other output modes
    if args.silent {
        return run_json(args, true).await;
    }

    if args.is_interactive() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    if args.json {
        return run_json(args, false).await;
    }

    run_text(args).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        source: args.source.clone(),
        fetch_timeout: Duration::from(args.fetch_timeout),
        zero_policy: if args.accept_zero {
            ZeroResultPolicy::Accept
        } else {
            ZeroResultPolicy::Reject
        },
        user_agent: format!("aggregate-pipeline/{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Run the pipeline and print the report as JSON.
/// `silent` suppresses everything except the returned error.
async fn run_json(args: Cli, silent: bool) -> Result<()> {
    let cfg = build_config(&args);
    let (out_tx, out_handle) = if silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    // Progress events are not shown in JSON mode; the report carries the full log.
    let (evt_tx, _evt_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let report = orchestrator::run_configured(&cfg, &evt_tx).await;

    handle_exports(&args, &report)?;

    if let Some(tx) = out_tx.as_ref() {
        let out = serde_json::to_string_pretty(&report)?;
        let _ = tx.send(OutputLine::Stdout(out));
    }

    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    ensure_completed(&report)
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<PipelineEvent>();

    let handle = tokio::spawn(async move { orchestrator::run_configured(&cfg, &evt_tx).await });

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            PipelineEvent::StageStarted { stage } => {
                let _ = out_tx.send(OutputLine::Stderr(format!("== {stage} ... ==")));
            }
            PipelineEvent::Progress(entry) => {
                let line = match entry.elapsed_ms {
                    Some(ms) => format!("{} ({ms} ms)", entry.message),
                    None => entry.message,
                };
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
            PipelineEvent::Info(message) => {
                let _ = out_tx.send(OutputLine::Stderr(message));
            }
            PipelineEvent::Finished { .. } => {}
        }
    }

    let report = handle.await.context("pipeline task failed")?;

    handle_exports(&args, &report)?;
    let summary = crate::text_summary::build_text_summary(&report);
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    drop(out_tx);
    let _ = out_handle.await;

    ensure_completed(&report)
}

/// Handle export operations for both text and JSON modes.
fn handle_exports(args: &Cli, report: &PipelineReport) -> Result<()> {
    if let Some(p) = args.export_json.as_deref() {
        crate::storage::export_json(p, report)?;
    }
    Ok(())
}

/// Turn a failed report into an error so the process exits non-zero.
fn ensure_completed(report: &PipelineReport) -> Result<()> {
    match report.outcome {
        PipelineOutcome::Completed => Ok(()),
        PipelineOutcome::Failed { stage } => {
            let detail = report
                .entries
                .last()
                .map(|e| e.message.as_str())
                .unwrap_or("no progress recorded");
            match stage {
                Some(stage) => Err(anyhow::anyhow!("pipeline failed at {stage}: {detail}")),
                None => Err(anyhow::anyhow!("pipeline failed: {detail}")),
            }
        }
    }
}
