mod clipboard;
mod help;
mod state;

use crate::cli::Cli;
use crate::export::ExportFormat;
use crate::model::{RunEvent, RunRecord, RunState};
use crate::orchestrator::{self, UiCommand};
use anyhow::{Context, Result};
use clipboard::{copy_to_clipboard, status_preview};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::UiState;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const HISTORY_LOAD_SIZE: usize = 200;

pub async fn run(args: Cli) -> Result<()> {
    let services = crate::cli::build_services(&args)?;
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let initial_repo = args
        .repo_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string);

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_initial = initial_repo.clone();
    let ui_handle =
        std::thread::spawn(move || run_threaded(ui_args, ui_initial, event_rx, cmd_tx));

    let res = orchestrator::run_controller(&services, initial_repo, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    let session = res?;
    if let Some(rec) = session.last_record() {
        tracing::debug!(state = rec.state.label(), repo_url = %rec.repo_url, "last run on exit");
    }
    Ok(())
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    args: Cli,
    initial_repo: Option<String>,
    mut event_rx: UnboundedReceiver<RunEvent>,
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
        auto_save: args.auto_save,
        history: crate::storage::load_recent(HISTORY_LOAD_SIZE).unwrap_or_default(),
        ..Default::default()
    };
    match initial_repo {
        Some(url) => {
            state.input = url.clone();
            state.begin_run(&url);
        }
        None => state.editing = true,
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            let finished = matches!(
                ev,
                RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. }
            );
            state.apply_event(ev);
            if finished {
                reload_history(&mut state);
            }
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &args, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if (k.modifiers, k.code) == (KeyModifiers::CONTROL, KeyCode::Char('c')) {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    break Ok(());
                }
                if state.editing {
                    handle_input_key(&mut state, &cmd_tx, k.code);
                    continue;
                }
                match k.code {
                    KeyCode::Char('q') => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    KeyCode::Char('i') | KeyCode::Char('/') => {
                        state.tab = 0;
                        state.editing = true;
                    }
                    KeyCode::Char('r') => match state.last_submitted.clone() {
                        Some(url) => submit(&mut state, &cmd_tx, url),
                        None => state.set_info("Nothing submitted yet. Press i to enter a URL"),
                    },
                    KeyCode::Char('c') | KeyCode::Esc => {
                        if state.is_running() {
                            let _ = cmd_tx.send(UiCommand::Cancel);
                        }
                    }
                    KeyCode::Char('s') => request_export(&mut state, &cmd_tx, ExportFormat::Svg),
                    KeyCode::Char('p') => request_export(&mut state, &cmd_tx, ExportFormat::Png),
                    KeyCode::Char('y') => match state.last_render.as_ref() {
                        Some(r) => {
                            let msg = match copy_to_clipboard(&r.dot) {
                                Ok(()) => format!(
                                    "✓ Copied DOT for job {} ({} bytes): {}",
                                    r.job_id.short(),
                                    r.dot.len(),
                                    status_preview(&r.dot, 40)
                                ),
                                Err(e) => format!("Clipboard copy failed: {e:#}"),
                            };
                            state.set_info(msg);
                        }
                        None => state.set_info("Nothing rendered yet"),
                    },
                    KeyCode::Char('?') => state.tab = 2,
                    KeyCode::Tab => state.tab = (state.tab + 1) % 3,
                    KeyCode::BackTab => state.tab = (state.tab + 2) % 3,
                    KeyCode::Up | KeyCode::Char('k') => {
                        if state.tab == 1 {
                            state.history_selected = state.history_selected.saturating_sub(1);
                        } else {
                            state.preview_scroll = state.preview_scroll.saturating_sub(1);
                        }
                    }
                    KeyCode::Down | KeyCode::Char('j') => {
                        if state.tab == 1 {
                            if state.history_selected + 1 < state.history.len() {
                                state.history_selected += 1;
                            }
                        } else if let Some(r) = state.last_render.as_ref() {
                            if state.preview_scroll + 1 < r.dot_preview.len() {
                                state.preview_scroll += 1;
                            }
                        }
                    }
                    KeyCode::Enter if state.tab == 1 => {
                        if let Some(rec) = state.history.get(state.history_selected) {
                            let url = rec.repo_url.clone();
                            state.tab = 0;
                            state.input = url.clone();
                            submit(&mut state, &cmd_tx, url);
                        }
                    }
                    KeyCode::Char('d') if state.tab == 1 => delete_selected(&mut state),
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    execute!(io::stdout(), LeaveAlternateScreen).ok();
    res
}

fn handle_input_key(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, code: KeyCode) {
    match code {
        KeyCode::Enter => {
            let url = state.input.trim().to_string();
            if url.is_empty() {
                state.set_info("Enter a repository URL first");
                return;
            }
            state.editing = false;
            submit(state, cmd_tx, url);
        }
        KeyCode::Esc => state.editing = false,
        KeyCode::Backspace => {
            state.input.pop();
        }
        KeyCode::Char(ch) => state.input.push(ch),
        _ => {}
    }
}

fn submit(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, url: String) {
    state.begin_run(&url);
    state.set_info(format!("Submitting {url}"));
    let _ = cmd_tx.send(UiCommand::Submit(url));
}

fn request_export(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, format: ExportFormat) {
    if state.last_render.is_none() {
        state.set_info("Nothing rendered yet; export skipped");
        return;
    }
    state.set_info(format!("Exporting {}…", format.extension().to_uppercase()));
    let _ = cmd_tx.send(UiCommand::Export { format, path: None });
}

fn reload_history(state: &mut UiState) {
    match crate::storage::load_recent(HISTORY_LOAD_SIZE) {
        Ok(history) => {
            state.history = history;
            if state.history_selected >= state.history.len() {
                state.history_selected = state.history.len().saturating_sub(1);
            }
        }
        Err(e) => state.push_log(format!("History reload failed: {e:#}")),
    }
}

fn delete_selected(state: &mut UiState) {
    let Some(rec) = state.history.get(state.history_selected).cloned() else {
        return;
    };
    match crate::storage::delete_run(&rec) {
        Ok(()) => {
            state.history.remove(state.history_selected);
            if state.history_selected >= state.history.len() {
                state.history_selected = state.history.len().saturating_sub(1);
            }
            state.set_info("Deleted");
        }
        Err(e) => state.set_info(format!("Delete failed: {e:#}")),
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, args: &Cli, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("archgraph"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, args, state),
        1 => draw_history(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn state_color(s: RunState) -> Color {
    match s {
        RunState::Rendered => Color::Green,
        RunState::Error => Color::Red,
        RunState::Cancelled => Color::Yellow,
        RunState::Idle => Color::Gray,
        _ => Color::Cyan,
    }
}

fn kv(label: &str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label:<11}"), Style::default().fg(Color::Gray)),
        Span::raw(value),
    ])
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, args: &Cli, state: &UiState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // Repository input
                Constraint::Min(6),    // Status + preview
                Constraint::Length(3), // Info line
            ]
            .as_ref(),
        )
        .split(area);

    let input_style = if state.editing {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    let cursor = if state.editing { "▏" } else { "" };
    let input = Paragraph::new(Line::from(vec![
        Span::styled(state.input.clone(), input_style),
        Span::styled(cursor, input_style),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(if state.editing {
                "Repository URL (Enter: submit, Esc: leave)"
            } else {
                "Repository URL (i: edit)"
            }),
    );
    f.render_widget(input, main[0]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(44), Constraint::Min(0)].as_ref())
        .split(main[1]);

    let mut status = vec![
        Line::from(vec![
            Span::styled(format!("{:<11}", "State"), Style::default().fg(Color::Gray)),
            Span::styled(
                state.run_state.label(),
                Style::default()
                    .fg(state_color(state.run_state))
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
        kv(
            "Job",
            state
                .job_id
                .as_ref()
                .map(|j| j.short().to_string())
                .unwrap_or_else(|| "-".into()),
        ),
        kv("Polls", state.poll_attempts.to_string()),
    ];
    if state.is_running() {
        if let Some(d) = state.elapsed() {
            status.push(kv("Elapsed", format!("{:.0}s", d.as_secs_f64())));
        }
        if let Some(d) = state.next_check {
            status.push(kv("Next check", format!("{:.1}s", d.as_secs_f64())));
        }
    }
    if let Some(failure) = state.last_failure.as_ref() {
        status.push(Line::from(Span::styled(
            format!("Last poll failed: {failure}"),
            Style::default().fg(Color::Red),
        )));
    }
    if let Some(r) = state.last_render.as_ref() {
        status.push(Line::from(""));
        status.push(kv("Rendered", r.job_id.short().to_string()));
        status.push(kv("Repository", r.repo_url.clone()));
        status.push(kv("SVG", format!("{} bytes", r.svg_bytes)));
        if let Some((w, h)) = r.pixel_size {
            status.push(kv("Size", format!("{w}x{h} px")));
        }
    }
    status.push(Line::from(""));
    status.push(kv("Backend", args.backend_url.clone()));
    status.push(kv(
        "Auto-save",
        (if state.auto_save { "on" } else { "off" }).into(),
    ));
    let status = Paragraph::new(status)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Run"));
    f.render_widget(status, body[0]);

    let preview_lines: Vec<Line> = match state.last_render.as_ref() {
        Some(r) => r
            .dot_preview
            .iter()
            .skip(state.preview_scroll)
            .map(|l| Line::from(l.clone()))
            .collect(),
        None => state
            .log
            .iter()
            .rev()
            .take(body[1].height.saturating_sub(2) as usize)
            .rev()
            .map(|l| Line::from(l.clone()))
            .collect(),
    };
    let preview_title = match state.last_render.as_ref() {
        Some(_) => "Graph description (s: SVG, p: PNG, y: copy)",
        None => "Activity",
    };
    let preview =
        Paragraph::new(preview_lines).block(Block::default().borders(Borders::ALL).title(preview_title));
    f.render_widget(preview, body[1]);

    let info = Paragraph::new(state.info.clone())
        .block(Block::default().borders(Borders::ALL).title("Info"));
    f.render_widget(info, main[2]);
}

fn history_line(rec: &RunRecord, selected: bool) -> Line<'static> {
    let ts = rec.timestamp_utc.get(..19).unwrap_or(rec.timestamp_utc.as_str()).replace('T', " ");
    let job = rec
        .job_id
        .as_ref()
        .map(|j| j.short().to_string())
        .unwrap_or_else(|| "-".into());
    let detail = match (rec.state, rec.error.as_ref()) {
        (RunState::Rendered, _) => match (rec.width_px, rec.height_px) {
            (Some(w), Some(h)) => format!("{w}x{h} px"),
            _ => format!("{} bytes", rec.svg_bytes.unwrap_or(0)),
        },
        (_, Some(e)) => e.clone(),
        _ => String::new(),
    };
    let marker = if selected { "> " } else { "  " };
    let style = if selected {
        Style::default().add_modifier(Modifier::REVERSED)
    } else {
        Style::default()
    };
    Line::from(vec![
        Span::styled(format!("{marker}{ts}  "), style),
        Span::styled(
            format!("{:<10}", rec.state.label()),
            Style::default().fg(state_color(rec.state)),
        ),
        Span::styled(format!("{job:<9}"), style),
        Span::styled(format!("{}  ", rec.repo_url), style),
        Span::styled(detail, Style::default().fg(Color::Gray)),
    ])
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let total = state.history.len();
    let mut lines: Vec<Line> = vec![Line::from(vec![
        Span::raw(format!(
            "History ({}/{}) - ",
            if total > 0 { state.history_selected + 1 } else { 0 },
            total
        )),
        Span::styled("↑/↓/j/k", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("Enter", Style::default().fg(Color::Magenta)),
        Span::raw(": resubmit, "),
        Span::styled("d", Style::default().fg(Color::Magenta)),
        Span::raw(": delete"),
    ])];

    if total == 0 {
        lines.push(Line::from("No saved runs yet."));
    } else {
        // Keep the selection visible.
        let max_items = (area.height as usize).saturating_sub(3).max(1);
        let offset = state.history_selected.saturating_sub(max_items - 1);
        for (i, rec) in state.history.iter().enumerate().skip(offset).take(max_items) {
            lines.push(history_line(rec, i == state.history_selected));
        }
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("History"));
    f.render_widget(p, area);
}
