mod help;

use crate::cli::Cli;
use crate::model::{PipelineEvent, PipelineOutcome, PipelineReport, ProgressEntry, Stage};
use crate::orchestrator::{self, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Tabs},
    Terminal,
};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageStatus {
    Pending,
    Running(Instant),
    Done(Option<u64>),
    Failed(Option<u64>),
}

struct UiState {
    tab: usize,
    info: String,
    source: String,
    stages: [StageStatus; 4],
    entries: Vec<ProgressEntry>,
    last_report: Option<PipelineReport>,
    run_start: Option<Instant>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            info: String::new(),
            source: String::new(),
            stages: [StageStatus::Pending; 4],
            entries: Vec::new(),
            last_report: None,
            run_start: None,
        }
    }
}

impl UiState {
    fn reset_run(&mut self) {
        self.stages = [StageStatus::Pending; 4];
        self.entries.clear();
        self.last_report = None;
        self.run_start = None;
    }

    fn finished_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s, StageStatus::Done(_)))
            .count()
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Unbounded channels avoid backpressure between the controller and the render loop.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res = orchestrator::run_controller(&args, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<PipelineEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        source: args.source.to_string(),
        info: if args.run_on_launch {
            "Starting…".into()
        } else {
            "Press r to run the pipeline".into()
        },
        ..Default::default()
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            match ev {
                PipelineEvent::Finished { report } => handle_run_finished(&args, &mut state, *report),
                other => apply_event(&mut state, other),
            }
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('r')) => {
                        state.info = "Restart requested…".into();
                        state.reset_run();
                        let _ = cmd_tx.send(UiCommand::Restart);
                    }
                    (_, KeyCode::Char('s')) => {
                        state.info = match state.last_report.as_ref() {
                            Some(report) => {
                                let path = crate::storage::default_report_path(report);
                                match crate::storage::export_json(&path, report) {
                                    Ok(()) => format!("Saved: {}", path.display()),
                                    Err(e) => format!("Save failed: {e:#}"),
                                }
                            }
                            None => "No finished run to save yet.".into(),
                        };
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 2;
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 1;
                    }
                    (_, KeyCode::Esc) => {
                        state.tab = 0;
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();
    res
}

fn apply_event(state: &mut UiState, ev: PipelineEvent) {
    match ev {
        PipelineEvent::StageStarted { stage } => {
            let now = Instant::now();
            if stage == Stage::Initialize {
                state.reset_run();
                state.run_start = Some(now);
            }
            state.stages[stage.index()] = StageStatus::Running(now);
            state.info = format!("{stage} ...");
        }
        PipelineEvent::Progress(entry) => {
            if let Some(stage) = entry.stage {
                state.stages[stage.index()] = if entry.ok {
                    StageStatus::Done(entry.elapsed_ms)
                } else {
                    StageStatus::Failed(entry.elapsed_ms)
                };
            }
            state.info = entry.message.clone();
            state.entries.push(entry);
        }
        PipelineEvent::Info(message) => state.info = message,
        PipelineEvent::Finished { report } => state.last_report = Some(*report),
    }
}

fn handle_run_finished(args: &Cli, state: &mut UiState, report: PipelineReport) {
    let processed = orchestrator::process_run_completion(args, &report);

    state.info = match report.outcome {
        PipelineOutcome::Completed => "Pipeline completed".into(),
        PipelineOutcome::Failed { .. } => report
            .entries
            .last()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "Pipeline failed".into()),
    };
    if !processed.export_messages.is_empty() {
        state.info = processed.export_messages.join("; ");
    }
    // The report is authoritative even if some progress events were missed.
    state.entries = report.entries.clone();
    state.last_report = Some(report);
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![Line::from("Pipeline"), Line::from("Help")])
        .select(state.tab)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("aggregate-pipeline"),
        )
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_pipeline(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_pipeline(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(6),
                Constraint::Length(3),
                Constraint::Min(3),
                Constraint::Length(3),
            ]
            .as_ref(),
        )
        .split(area);

    let stage_lines: Vec<Line> = Stage::SEQUENCE
        .iter()
        .map(|stage| stage_line(*stage, state.stages[stage.index()]))
        .collect();
    let stages = Paragraph::new(stage_lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Stages (source: {})", state.source)),
    );
    f.render_widget(stages, rows[0]);

    let done = state.finished_stages();
    let total = Stage::SEQUENCE.len();
    let failed = state
        .stages
        .iter()
        .any(|s| matches!(s, StageStatus::Failed(_)));
    let gauge_color = if failed { Color::Red } else { Color::Green };
    let elapsed = state
        .run_start
        .map(|t| format!(" · {:.1}s", t.elapsed().as_secs_f64()))
        .unwrap_or_default();
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(gauge_color))
        .ratio(done as f64 / total as f64)
        .label(format!("{done}/{total}{elapsed}"));
    f.render_widget(gauge, rows[1]);

    let items: Vec<ListItem> = state
        .entries
        .iter()
        .map(|e| {
            let color = if e.ok { Color::Green } else { Color::Red };
            let elapsed = e
                .elapsed_ms
                .map(|ms| format!(" ({ms} ms)"))
                .unwrap_or_default();
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{} ", short_time(&e.timestamp_utc)),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(e.message.clone(), Style::default().fg(color)),
                Span::raw(elapsed),
            ]))
        })
        .collect();
    let log = List::new(items).block(Block::default().borders(Borders::ALL).title("Log"));
    f.render_widget(log, rows[2]);

    let status = Paragraph::new(Line::from(vec![
        Span::raw(state.info.clone()),
        Span::styled("   q quit · r rerun · s save · ? help", Style::default().fg(Color::DarkGray)),
    ]))
    .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, rows[3]);
}

fn stage_line(stage: Stage, status: StageStatus) -> Line<'static> {
    let (mark, color, detail) = match status {
        StageStatus::Pending => ("·", Color::DarkGray, String::new()),
        StageStatus::Running(since) => (
            "…",
            Color::Yellow,
            format!("{} ms", since.elapsed().as_millis()),
        ),
        StageStatus::Done(ms) => ("✓", Color::Green, fmt_ms(ms)),
        StageStatus::Failed(ms) => ("✗", Color::Red, fmt_ms(ms)),
    };
    Line::from(vec![
        Span::styled(format!(" {mark} "), Style::default().fg(color)),
        Span::raw(format!("{:<22}", stage.label())),
        Span::styled(detail, Style::default().fg(Color::Cyan)),
    ])
}

fn fmt_ms(ms: Option<u64>) -> String {
    ms.map(|ms| format!("{ms} ms")).unwrap_or_default()
}

/// `HH:MM:SS` part of an RFC 3339 timestamp.
fn short_time(ts: &str) -> &str {
    ts.split_once('T')
        .map(|(_, t)| t.get(..8).unwrap_or(t))
        .unwrap_or(ts)
}
