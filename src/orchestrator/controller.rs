//! Run lifecycle controller.
//!
//! Owns start/cancel/restart orchestration and the session, and emits events for
//! presentation layers.

use super::post_process::{process_run_completion, process_run_failure, PostProcessOptions};
use super::Session;
use crate::backend::Backend;
use crate::engine::{EngineControl, RunEngine, RunError};
use crate::error::ClientError;
use crate::export::{export_image, ExportFormat};
use crate::model::{InfoEvent, JobId, PollPolicy, RunEvent, RunOutcome, RunState};
use crate::render::Renderer;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tracing::{debug, info};

/// Commands emitted by UI layers to control runs.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    /// Start a run for this repository, cancelling the active one first.
    Submit(String),
    Cancel,
    Export {
        format: ExportFormat,
        path: Option<PathBuf>,
    },
    Quit,
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub(crate) struct Services {
    pub backend: Arc<dyn Backend>,
    pub renderer: Arc<dyn Renderer>,
    pub policy: PollPolicy,
    pub post: PostProcessOptions,
}

/// Internal handle for a running job.
struct RunCtx {
    repo_url: String,
    /// Known once the backend accepted the submission.
    job_id: Option<JobId>,
    ctrl_tx: UnboundedSender<EngineControl>,
    event_rx: Option<UnboundedReceiver<RunEvent>>,
    handle: Option<tokio::task::JoinHandle<std::result::Result<RunOutcome, RunError>>>,
}

type JoinResult = std::result::Result<std::result::Result<RunOutcome, RunError>, tokio::task::JoinError>;

/// Next thing that happened to the active run.
enum Step {
    Event(RunEvent),
    EventsClosed,
    Done(JoinResult),
}

impl RunCtx {
    fn cancel(&self) {
        debug!(job_id = ?self.job_id, "cancelling run");
        let _ = self.ctrl_tx.send(EngineControl::Cancel);
    }

    /// Wait for the next engine event or for completion. Events are preferred so state
    /// changes reach the UI before the completion. Cancel-safe.
    async fn next_step(&mut self) -> Step {
        let RunCtx {
            event_rx, handle, ..
        } = self;
        tokio::select! {
            biased;
            ev = async {
                match event_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => futures::future::pending().await,
                }
            } => match ev {
                Some(ev) => Step::Event(ev),
                None => Step::EventsClosed,
            },
            res = async {
                match handle.as_mut() {
                    Some(h) => h.await,
                    None => futures::future::pending().await,
                }
            } => Step::Done(res),
        }
    }
}

/// Spawn a new run and return its control handle.
fn start_run(services: &Services, repo_url: String) -> RunCtx {
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let engine = RunEngine::new(
        services.backend.clone(),
        services.renderer.clone(),
        services.policy.clone(),
    );
    let url = repo_url.clone();
    let handle = tokio::spawn(async move { engine.run(url, event_tx, ctrl_rx).await });
    RunCtx {
        repo_url,
        job_id: None,
        ctrl_tx,
        event_rx: Some(event_rx),
        handle: Some(handle),
    }
}

fn message(event_tx: &UnboundedSender<RunEvent>, msg: impl Into<String>) {
    let _ = event_tx.send(RunEvent::Info(InfoEvent::Message(msg.into())));
}

/// Forward an engine event, remembering the job id of the active run.
fn forward(ctx: &mut RunCtx, event_tx: &UnboundedSender<RunEvent>, ev: RunEvent) {
    if let RunEvent::StateChanged {
        job_id: Some(id), ..
    } = &ev
    {
        ctx.job_id.get_or_insert_with(|| id.clone());
    }
    let _ = event_tx.send(ev);
}

/// Orchestrate runs based on UI commands and emit events back to presentation layers.
/// Returns the session so callers can inspect the last image.
pub(crate) async fn run_controller(
    services: &Services,
    initial_repo: Option<String>,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<Session> {
    let mut session = Session::new();
    let mut run_ctx = initial_repo.map(|url| start_run(services, url));
    // Latest submission waiting for the active run to wind down.
    let mut pending_submit: Option<String> = None;
    let mut quit_pending = false;
    let mut cmd_open = true;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep UI feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if cmd_open => {
                // A closed command channel acts as Quit; stop polling it.
                cmd_open = cmd.is_some();
                match cmd {
                    Some(UiCommand::Submit(url)) => {
                        // Runs are serialized: cancel the active run first, then start the new
                        // one once we observe completion.
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel();
                            pending_submit = Some(url);
                            message(&event_tx, "Cancelling previous run…");
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            run_ctx = Some(start_run(services, url));
                        }
                    }
                    Some(UiCommand::Cancel) => {
                        pending_submit = None;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel();
                            message(&event_tx, "Cancelling…");
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            message(&event_tx, "No active run");
                        }
                    }
                    Some(UiCommand::Export { format, path }) => {
                        let label = format.extension().to_uppercase();
                        match export_image(&session, services.renderer.as_ref(), format, path.as_deref()).await {
                            Ok(Some(p)) => message(&event_tx, format!("Exported {label}: {}", p.display())),
                            Ok(None) => message(&event_tx, "Nothing rendered yet; export skipped"),
                            Err(e) => message(&event_tx, format!("Export {label} failed: {e}")),
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        // Quit waits for the current run to finish so we can cleanly finalize UI state.
                        quit_pending = true;
                        pending_submit = None;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel();
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            break;
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            step = async {
                match run_ctx.as_mut() {
                    Some(ctx) => ctx.next_step().await,
                    None => futures::future::pending().await,
                }
            } => {
                match step {
                    Step::Event(ev) => {
                        if let Some(ctx) = run_ctx.as_mut() {
                            forward(ctx, &event_tx, ev);
                        }
                    }
                    Step::EventsClosed => {
                        if let Some(ctx) = run_ctx.as_mut() {
                            ctx.event_rx = None;
                        }
                    }
                    Step::Done(join_res) => {
                        let Some(mut ctx) = run_ctx.take() else { continue };
                        ctx.handle.take();
                        // Flush events the engine sent before finishing.
                        if let Some(mut rx) = ctx.event_rx.take() {
                            while let Ok(ev) = rx.try_recv() {
                                forward(&mut ctx, &event_tx, ev);
                            }
                        }
                        match join_res {
                            Ok(Ok(outcome)) => {
                                finish_success(services, &mut session, &event_tx, outcome).await;
                            }
                            Ok(Err(err)) => finish_failure(services, &mut session, &event_tx, &ctx, err),
                            Err(e) => message(&event_tx, format!("Run join failed: {e}")),
                        }
                        cancel_deadline = None;
                        if quit_pending {
                            break;
                        }
                        if let Some(url) = pending_submit.take() {
                            message(&event_tx, "Starting new run…");
                            run_ctx = Some(start_run(services, url));
                        }
                    }
                }
            }
            // If cancel stalls (e.g., network op in flight), keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        message(&event_tx, "Still cancelling…");
                        cancel_deadline = None;
                    }
                }
            }
        }
    }

    Ok(session)
}

async fn finish_success(
    services: &Services,
    session: &mut Session,
    event_tx: &UnboundedSender<RunEvent>,
    outcome: RunOutcome,
) {
    info!(job_id = %outcome.job_id, "run completed");
    session.set_image(outcome.image.clone());
    let processed = process_run_completion(
        &services.post,
        session,
        services.backend.as_ref(),
        services.renderer.as_ref(),
        &outcome,
    )
    .await;
    for msg in processed.export_messages {
        message(event_tx, msg);
    }
    if let Some(p) = processed.auto_saved_path {
        message(event_tx, format!("Saved: {}", p.display()));
    }
    session.set_last_record(processed.record);
    let _ = event_tx.send(RunEvent::RunCompleted {
        outcome: Box::new(outcome),
    });
}

fn finish_failure(
    services: &Services,
    session: &mut Session,
    event_tx: &UnboundedSender<RunEvent>,
    ctx: &RunCtx,
    err: RunError,
) {
    let state = match err.error {
        ClientError::Cancelled => RunState::Cancelled,
        _ => RunState::Error,
    };
    let job_id = err.job_id.or_else(|| ctx.job_id.clone());
    info!(job_id = ?job_id, state = state.label(), "run ended: {}", err.error);
    let text = err.error.to_string();
    let processed = process_run_failure(
        &services.post,
        &ctx.repo_url,
        job_id.clone(),
        state,
        err.poll,
        text.clone(),
    );
    for msg in processed.export_messages {
        message(event_tx, msg);
    }
    session.set_last_record(processed.record);
    let _ = event_tx.send(RunEvent::RunFailed {
        repo_url: ctx.repo_url.clone(),
        job_id,
        state,
        message: text,
    });
}
