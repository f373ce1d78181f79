//! Post-run processing utilities.
//!
//! Builds the run record, applies requested exports, fetches extra artifacts and auto-saves
//! the record after a run finishes.

use super::Session;
use crate::backend::Backend;
use crate::cli::Cli;
use crate::engine::PollReport;
use crate::export::{export_image, ExportFormat};
use crate::model::{ArtifactKind, JobId, RunOutcome, RunRecord, RunState};
use crate::render::Renderer;
use crate::storage;
use std::path::{Path, PathBuf};

/// What to do with a finished run.
#[derive(Debug, Clone, Default)]
pub(crate) struct PostProcessOptions {
    pub backend_url: String,
    pub auto_save: bool,
    /// Overrides the default history directory.
    pub history_dir: Option<PathBuf>,
    pub export_svg: Option<PathBuf>,
    pub export_png: Option<PathBuf>,
    pub save_dot: Option<PathBuf>,
    pub artifacts: Vec<ArtifactKind>,
    pub artifact_dir: PathBuf,
}

impl PostProcessOptions {
    pub fn from_cli(args: &Cli) -> Self {
        Self {
            backend_url: args.backend_url.clone(),
            auto_save: args.auto_save,
            history_dir: None,
            export_svg: args.export_svg.clone(),
            export_png: args.export_png.clone(),
            save_dot: args.save_dot.clone(),
            artifacts: args.artifact.clone(),
            artifact_dir: args.artifact_dir.clone(),
        }
    }
}

/// Result of post-run processing, ready for presentation layers.
#[derive(Debug)]
pub(crate) struct ProcessedRun {
    pub record: RunRecord,
    pub export_messages: Vec<String>,
    pub auto_saved_path: Option<PathBuf>,
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Process a successful run. `session` must already hold the run's image.
pub(crate) async fn process_run_completion(
    opts: &PostProcessOptions,
    session: &Session,
    backend: &dyn Backend,
    renderer: &dyn Renderer,
    outcome: &RunOutcome,
) -> ProcessedRun {
    let mut exported = Vec::new();
    let mut export_messages = Vec::new();

    let image_exports = [
        (ExportFormat::Svg, opts.export_svg.as_deref()),
        (ExportFormat::Png, opts.export_png.as_deref()),
    ];
    for (format, path) in image_exports {
        let Some(path) = path else { continue };
        let label = format.extension().to_uppercase();
        match export_image(session, renderer, format, Some(path)).await {
            Ok(Some(p)) => {
                export_messages.push(format!("Exported {label}: {}", p.display()));
                exported.push(p.display().to_string());
            }
            Ok(None) => export_messages.push(format!("Export {label} skipped: nothing rendered")),
            Err(e) => export_messages.push(format!("Export {label} failed: {e}")),
        }
    }

    if let Some(path) = opts.save_dot.as_deref() {
        match write_file(path, outcome.image.source.text.as_bytes()) {
            Ok(()) => {
                export_messages.push(format!("Saved DOT: {}", path.display()));
                exported.push(path.display().to_string());
            }
            Err(e) => export_messages.push(format!("Save DOT failed: {e:#}")),
        }
    }

    for kind in &opts.artifacts {
        let path = artifact_path(&opts.artifact_dir, &outcome.job_id, *kind);
        let res = match backend.fetch_artifact(&outcome.job_id, *kind).await {
            Ok(bytes) => write_file(&path, &bytes),
            Err(e) => Err(e.into()),
        };
        match res {
            Ok(()) => {
                export_messages.push(format!(
                    "Fetched {}: {}",
                    kind.as_path_segment(),
                    path.display()
                ));
                exported.push(path.display().to_string());
            }
            Err(e) => export_messages.push(format!(
                "Fetch {} failed: {e:#}",
                kind.as_path_segment()
            )),
        }
    }

    let size = outcome.image.pixel_size();
    let record = RunRecord {
        timestamp_utc: now_rfc3339(),
        backend_url: opts.backend_url.clone(),
        repo_url: outcome.repo_url.clone(),
        job_id: Some(outcome.job_id.clone()),
        state: RunState::Rendered,
        poll_attempts: outcome.poll_attempts,
        poll_duration: Some(outcome.poll_duration),
        svg_bytes: Some(outcome.image.svg.len()),
        width_px: size.map(|(w, _)| w),
        height_px: size.map(|(_, h)| h),
        exported,
        error: None,
    };

    let auto_saved_path = auto_save(opts, &record, &mut export_messages);
    ProcessedRun {
        record,
        export_messages,
        auto_saved_path,
    }
}

/// Process a failed run. Cancelled runs are not saved to history.
pub(crate) fn process_run_failure(
    opts: &PostProcessOptions,
    repo_url: &str,
    job_id: Option<JobId>,
    state: RunState,
    poll: PollReport,
    message: String,
) -> ProcessedRun {
    let record = RunRecord {
        timestamp_utc: now_rfc3339(),
        backend_url: opts.backend_url.clone(),
        repo_url: repo_url.to_string(),
        job_id,
        state,
        poll_attempts: poll.attempts,
        poll_duration: (poll.attempts > 0).then_some(poll.elapsed),
        svg_bytes: None,
        width_px: None,
        height_px: None,
        exported: Vec::new(),
        error: Some(message),
    };
    let mut export_messages = Vec::new();
    let auto_saved_path = if state == RunState::Cancelled {
        None
    } else {
        auto_save(opts, &record, &mut export_messages)
    };
    ProcessedRun {
        record,
        export_messages,
        auto_saved_path,
    }
}

fn auto_save(opts: &PostProcessOptions, record: &RunRecord, messages: &mut Vec<String>) -> Option<PathBuf> {
    if !opts.auto_save {
        return None;
    }
    let res = match opts.history_dir.as_deref() {
        Some(dir) => storage::save_run_in(dir, record),
        None => storage::save_run(record),
    };
    match res {
        Ok(p) => Some(p),
        Err(e) => {
            messages.push(format!("Auto-save failed: {e:#}"));
            None
        }
    }
}

fn artifact_path(dir: &Path, job_id: &JobId, kind: ArtifactKind) -> PathBuf {
    dir.join(format!(
        "{}_{}.{}",
        job_id.file_stem(),
        kind.as_path_segment(),
        kind.file_extension()
    ))
}

fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    use anyhow::Context;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}
