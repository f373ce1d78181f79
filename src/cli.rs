use crate::backend::HttpBackend;
use crate::engine::{EngineControl, RunEngine};
use crate::error::ClientError;
use crate::model::{ArtifactKind, PollPolicy, RunConfig, RunEvent, RunState};
use crate::orchestrator::{
    process_run_completion, process_run_failure, PostProcessOptions, ProcessedRun, Services,
    Session,
};
use crate::render::GraphvizRenderer;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
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
    name = "archgraph",
    version,
    about = "Submit a repository for architecture analysis and render the resulting graph"
)]
pub struct Cli {
    /// Repository URL to analyse (the TUI asks for one when omitted)
    pub repo_url: Option<String>,

    /// Base URL of the analysis backend
    #[arg(long, env = "ARCHGRAPH_BACKEND_URL", default_value = "http://localhost:8000")]
    pub backend_url: String,

    /// Print the run record as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Delay between status checks while the job is running
    #[arg(long, default_value = "2s")]
    pub poll_interval: humantime::Duration,

    /// Upper bound for the retry delay after failed status checks
    #[arg(long, default_value = "15s")]
    pub poll_max_interval: humantime::Duration,

    /// Give up when the job is still not ready after this long
    #[arg(long, default_value = "10m")]
    pub poll_timeout: humantime::Duration,

    /// Consecutive failed status checks tolerated before giving up
    #[arg(long, default_value_t = 5)]
    pub max_poll_failures: u32,

    /// Timeout for each HTTP request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Graphviz executable used for layout and rasterization
    #[arg(long, default_value = "dot")]
    pub renderer: String,

    /// Write the rendered graph as SVG
    #[arg(long)]
    pub export_svg: Option<PathBuf>,

    /// Write the rendered graph as PNG
    #[arg(long)]
    pub export_png: Option<PathBuf>,

    /// Write the raw graph description (DOT)
    #[arg(long)]
    pub save_dot: Option<PathBuf>,

    /// Also download these backend result files (repeatable)
    #[arg(long, value_enum)]
    pub artifact: Vec<ArtifactKind>,

    /// Directory for downloaded result files
    #[arg(long, default_value = ".")]
    pub artifact_dir: PathBuf,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Errors only on stderr
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored log output
    #[arg(long)]
    pub no_color: bool,
}

impl Cli {
    /// Whether this invocation runs the interactive TUI.
    pub fn is_interactive(&self) -> bool {
        cfg!(feature = "tui") && !self.silent && !self.json && !self.text
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    if args.is_interactive() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
    }

    if args
        .repo_url
        .as_deref()
        .map_or(true, |u| u.trim().is_empty())
    {
        return Err(ClientError::EmptyRepositoryUrl)
            .context("a repository URL is required outside the TUI");
    }

    if args.json || args.silent {
        let silent = args.silent;
        return run_json(args, silent).await;
    }

    run_text(args).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        backend_url: args.backend_url.clone(),
        user_agent: format!("archgraph-cli/{}", env!("CARGO_PKG_VERSION")),
        request_timeout: Duration::from(args.request_timeout),
        poll: PollPolicy {
            interval: Duration::from(args.poll_interval),
            max_interval: Duration::from(args.poll_max_interval),
            timeout: Duration::from(args.poll_timeout),
            max_consecutive_failures: args.max_poll_failures,
        },
        renderer_command: args.renderer.clone(),
    }
}

/// Wire the HTTP backend and Graphviz renderer for this invocation.
pub(crate) fn build_services(args: &Cli) -> Result<Services> {
    let cfg = build_config(args);
    let backend = HttpBackend::new(&cfg).context("configure backend client")?;
    Ok(Services {
        backend: Arc::new(backend),
        renderer: Arc::new(GraphvizRenderer::new(cfg.renderer_command.clone())),
        policy: cfg.poll.clone(),
        post: PostProcessOptions::from_cli(args),
    })
}

/// A single non-interactive run after post-processing.
struct RunReport {
    processed: ProcessedRun,
    failure: Option<ClientError>,
}

/// Run the engine once, feeding every event to `on_event`. Ctrl-C cancels the run.
async fn run_once(args: &Cli, mut on_event: impl FnMut(&RunEvent)) -> Result<RunReport> {
    let repo_url = args.repo_url.clone().unwrap_or_default();
    let services = build_services(args)?;
    let engine = RunEngine::new(
        services.backend.clone(),
        services.renderer.clone(),
        services.policy.clone(),
    );
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    let url = repo_url.clone();
    let mut handle = tokio::spawn(async move { engine.run(url, evt_tx, ctrl_rx).await });

    let mut interrupted = false;
    let joined = loop {
        tokio::select! {
            Some(ev) = evt_rx.recv() => on_event(&ev),
            res = &mut handle => break res,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                let _ = ctrl_tx.send(EngineControl::Cancel);
            }
        }
    };
    while let Ok(ev) = evt_rx.try_recv() {
        on_event(&ev);
    }

    match joined.context("run task failed")? {
        Ok(outcome) => {
            let mut session = Session::new();
            session.set_image(outcome.image.clone());
            let processed = process_run_completion(
                &services.post,
                &session,
                services.backend.as_ref(),
                services.renderer.as_ref(),
                &outcome,
            )
            .await;
            Ok(RunReport {
                processed,
                failure: None,
            })
        }
        Err(err) => {
            let state = match err.error {
                ClientError::Cancelled => RunState::Cancelled,
                _ => RunState::Error,
            };
            let processed = process_run_failure(
                &services.post,
                &repo_url,
                err.job_id,
                state,
                err.poll,
                err.error.to_string(),
            );
            Ok(RunReport {
                processed,
                failure: Some(err.error),
            })
        }
    }
}

async fn run_json(args: Cli, silent: bool) -> Result<()> {
    let report = run_once(&args, |_| {}).await?;

    if !silent {
        let (tx, handle) = spawn_output_writer();
        let out = serde_json::to_string_pretty(&report.processed.record)?;
        let _ = tx.send(OutputLine::Stdout(out));
        for msg in &report.processed.export_messages {
            let _ = tx.send(OutputLine::Stderr(msg.clone()));
        }
        if let Some(p) = report.processed.auto_saved_path.as_ref() {
            let _ = tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
        }
        drop(tx);
        let _ = handle.await;
    }

    match report.failure {
        Some(e) => Err(e).context("analysis run failed"),
        None => Ok(()),
    }
}

async fn run_text(args: Cli) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();

    let progress_tx = out_tx.clone();
    let report = run_once(&args, move |ev| {
        if let Some(line) = crate::text_summary::progress_line(ev) {
            let _ = progress_tx.send(OutputLine::Stderr(line));
        }
    })
    .await?;

    for msg in &report.processed.export_messages {
        let _ = out_tx.send(OutputLine::Stderr(msg.clone()));
    }
    let summary = crate::text_summary::build_text_summary(&report.processed.record);
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    if let Some(p) = report.processed.auto_saved_path.as_ref() {
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
    }
    drop(out_tx);
    let _ = out_handle.await;

    match report.failure {
        Some(e) => Err(e).context("analysis run failed"),
        None => Ok(()),
    }
}
