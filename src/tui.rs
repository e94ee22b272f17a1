use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::ChelsaError;
use crate::orchestrator::{CancelFlag, EntryState};
use crate::output::bytes_to_human;

const EVENTS_MAX: usize = 8;
const BAR_WIDTH: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Transfer,
    Retry(u32),
    Clip,
}

#[derive(Debug, Clone)]
struct ActiveEntry {
    path: String,
    stage: Stage,
    bytes: u64,
    expected: Option<u64>,
}

#[derive(Debug)]
struct DashboardState {
    title: String,
    status: String,
    total: usize,
    pending: usize,
    succeeded: usize,
    skipped: usize,
    failed: usize,
    cancelled: usize,
    retries: u32,
    expected_bytes: u64,
    transferred_bytes: u64,
    active: BTreeMap<usize, ActiveEntry>,
    events: VecDeque<String>,
    started: Instant,
}

impl DashboardState {
    fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            status: "starting".to_string(),
            total: 0,
            pending: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            cancelled: 0,
            retries: 0,
            expected_bytes: 0,
            transferred_bytes: 0,
            active: BTreeMap::new(),
            events: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn finished(&self) -> usize {
        self.succeeded + self.skipped + self.failed + self.cancelled
    }

    fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Message(message) => {
                self.status = message.clone();
                self.push_event(message);
            }
            ProgressEvent::RunStarted {
                kind,
                total,
                pending,
                expected_bytes,
            } => {
                self.total = total;
                self.pending = pending;
                self.expected_bytes = expected_bytes;
                self.status = format!("downloading {kind}");
                self.push_event(format!(
                    "{total} entries, {pending} to fetch ({})",
                    bytes_to_human(expected_bytes)
                ));
            }
            ProgressEvent::TransferStarted {
                worker,
                path,
                expected_size,
            } => {
                self.active.insert(
                    worker,
                    ActiveEntry {
                        path,
                        stage: Stage::Transfer,
                        bytes: 0,
                        expected: expected_size,
                    },
                );
            }
            ProgressEvent::TransferProgress { worker, bytes, .. } => {
                if let Some(entry) = self.active.get_mut(&worker) {
                    entry.bytes = bytes;
                }
            }
            ProgressEvent::TransferRetry {
                worker,
                path,
                attempt,
                class,
                delay,
            } => {
                self.retries = self.retries.saturating_add(1);
                if let Some(entry) = self.active.get_mut(&worker) {
                    entry.stage = Stage::Retry(attempt);
                }
                self.push_event(format!(
                    "retry {attempt} {} ({class}, {:.0}s)",
                    short_name(&path),
                    delay.as_secs_f64()
                ));
            }
            ProgressEvent::ClipStarted { worker, .. } => {
                if let Some(entry) = self.active.get_mut(&worker) {
                    entry.stage = Stage::Clip;
                }
            }
            ProgressEvent::EntryFinished { worker, outcome } => {
                if let Some(worker) = worker {
                    self.active.remove(&worker);
                }
                self.transferred_bytes += outcome.bytes_transferred;
                let name = short_name(&outcome.remote_path).to_string();
                match outcome.state {
                    EntryState::Done => {
                        self.succeeded += 1;
                        self.push_event(format!("done {name}"));
                    }
                    EntryState::Skipped => self.skipped += 1,
                    EntryState::Cancelled => self.cancelled += 1,
                    EntryState::TransferFailed | EntryState::ClipFailed => {
                        self.failed += 1;
                        self.push_event(format!(
                            "FAILED {name}: {}",
                            outcome.reason.as_deref().unwrap_or("unknown")
                        ));
                    }
                }
            }
        }
    }

    fn push_event(&mut self, item: String) {
        self.events.push_back(item);
        while self.events.len() > EVENTS_MAX {
            self.events.pop_front();
        }
    }
}

struct TuiProgress {
    state: Arc<Mutex<DashboardState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.apply(event);
        }
    }
}

/// Full-screen progress dashboard. `q`, Esc or Ctrl+C request cancellation;
/// pressing again while cancelling abandons the run.
pub struct Tui {
    state: Arc<Mutex<DashboardState>>,
    cancel: CancelFlag,
}

impl Tui {
    pub fn new(title: &str, cancel: CancelFlag) -> Self {
        Self {
            state: Arc::new(Mutex::new(DashboardState::new(title))),
            cancel,
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, ChelsaError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        let outcome = loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_dashboard(frame, &state, self.cancel.is_cancelled(), tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                handle.join().ok();
                break Some(result);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        break None;
                    }
                }
            }

            tick = tick.wrapping_add(1);
        };

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        match outcome {
            Some(result) => result.map_err(miette::Report::new),
            None => Err(miette::Report::msg("aborted")),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        let quit = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
            || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL));
        if !quit {
            return false;
        }
        if self.cancel.is_cancelled() {
            return true;
        }
        self.cancel.cancel();
        if let Ok(mut state) = self.state.lock() {
            state.status = "cancelling: waiting for active entries".to_string();
            state.push_event("cancel requested".to_string());
        }
        false
    }
}

fn draw_dashboard(frame: &mut ratatui::Frame, state: &DashboardState, cancelling: bool, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(EVENTS_MAX as u16 + 1),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state, cancelling, tick), chunks[0]);

    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(chunks[1]);
    frame.render_widget(draw_active(state), main[0]);
    frame.render_widget(draw_counters(state), main[1]);
    frame.render_widget(draw_events(state), chunks[2]);

    let hint = if cancelling {
        "cancelling; press q again to abandon in-flight entries"
    } else {
        "q: cancel run"
    };
    frame.render_widget(
        Paragraph::new(Span::styled(hint, Style::default().fg(Color::Gray))),
        chunks[3],
    );
}

fn draw_header(state: &DashboardState, cancelling: bool, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let elapsed = state.started.elapsed().as_secs();
    let percent = percent(state.finished() as u64, state.total as u64);
    let status_color = if cancelling { Color::Yellow } else { Color::Cyan };
    let title_line = Line::from(vec![
        Span::styled(
            "CHELSA-DOWNLOAD",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!("   {}   ", state.title)),
        Span::styled(state.status.clone(), Style::default().fg(status_color)),
        Span::raw(format!(
            "   {:02}:{:02}:{:02} ",
            elapsed / 3600,
            (elapsed / 60) % 60,
            elapsed % 60
        )),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    let progress_line = Line::from(vec![
        Span::styled("Overall: ", Style::default().fg(Color::Gray)),
        Span::raw(progress_bar(percent)),
        Span::raw(format!(
            " {percent:>3}%  {}/{} entries",
            state.finished(),
            state.total
        )),
    ]);
    Paragraph::new(vec![title_line, progress_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_active(state: &DashboardState) -> Paragraph<'static> {
    let mut lines = vec![Line::from(Span::styled(
        "ACTIVE",
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
    ))];
    if state.active.is_empty() {
        lines.push(Line::from(Span::styled(
            "idle",
            Style::default().fg(Color::Gray),
        )));
    }
    for (worker, entry) in &state.active {
        let (label, color) = match entry.stage {
            Stage::Transfer => ("fetch".to_string(), Color::Cyan),
            Stage::Retry(attempt) => (format!("retry{attempt}"), Color::Yellow),
            Stage::Clip => ("clip".to_string(), Color::Green),
        };
        let progress = match entry.expected {
            Some(expected) => {
                let pct = percent(entry.bytes, expected);
                format!(
                    "{} {pct:>3}% {}",
                    progress_bar_width(pct, 10),
                    bytes_to_human(entry.bytes)
                )
            }
            None => bytes_to_human(entry.bytes),
        };
        lines.push(Line::from(vec![
            Span::styled(format!("#{worker:<2} "), Style::default().fg(Color::Gray)),
            Span::styled(format!("{label:<7}"), Style::default().fg(color)),
            Span::raw(format!("{progress:<24} ")),
            Span::raw(short_name(&entry.path).to_string()),
        ]));
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::RIGHT))
        .wrap(Wrap { trim: true })
}

fn draw_counters(state: &DashboardState) -> Paragraph<'static> {
    let row = |label: &str, value: String, color: Color| {
        Line::from(vec![
            Span::styled(format!("{label:<12}"), Style::default().fg(Color::Gray)),
            Span::styled(value, Style::default().fg(color)),
        ])
    };
    let lines = vec![
        Line::from(Span::styled(
            "COUNTERS",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
        row("Succeeded", state.succeeded.to_string(), Color::Green),
        row("Skipped", state.skipped.to_string(), Color::Gray),
        row("Failed", state.failed.to_string(), Color::Red),
        row("Cancelled", state.cancelled.to_string(), Color::Yellow),
        row("Retries", state.retries.to_string(), Color::Yellow),
        row(
            "Transferred",
            format!(
                "{} / {}",
                bytes_to_human(state.transferred_bytes),
                bytes_to_human(state.expected_bytes)
            ),
            Color::White,
        ),
        row("To fetch", state.pending.to_string(), Color::White),
    ];
    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_events(state: &DashboardState) -> Paragraph<'static> {
    let mut lines = vec![Line::from(Span::styled(
        "Recent events:",
        Style::default().fg(Color::Gray),
    ))];
    for event in &state.events {
        lines.push(Line::from(format!("- {event}")));
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::TOP))
        .wrap(Wrap { trim: true })
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as f64 / total as f64) * 100.0) as u8
}

fn progress_bar(percent: u8) -> String {
    progress_bar_width(percent, BAR_WIDTH)
}

fn progress_bar_width(percent: u8, total: usize) -> String {
    let filled = (percent as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn short_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
