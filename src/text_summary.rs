//! Text summary builder for CLI output.
//!
//! Formats run events as progress lines and the final record as human-readable lines.

use crate::model::{RunEvent, RunRecord};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// One progress line for an engine event, or `None` for events not worth printing.
pub(crate) fn progress_line(ev: &RunEvent) -> Option<String> {
    match ev {
        RunEvent::StateChanged { state, job_id } => Some(match job_id {
            Some(id) => format!("== {} (job {}) ==", state.label(), id),
            None => format!("== {} ==", state.label()),
        }),
        RunEvent::PollAttempt {
            attempt,
            ready: false,
            failure,
            next_delay,
            ..
        } => {
            let wait = next_delay
                .map(|d| format!(", next check in {:.1}s", d.as_secs_f64()))
                .unwrap_or_default();
            Some(match failure {
                Some(f) => format!("Poll #{attempt}: {f}{wait}"),
                None => format!("Poll #{attempt}: not ready{wait}"),
            })
        }
        RunEvent::PollAttempt { attempt, .. } => Some(format!("Poll #{attempt}: ready")),
        RunEvent::Info(info) => Some(info.to_message()),
        RunEvent::RunCompleted { .. } => None,
        RunEvent::RunFailed { state, message, .. } => {
            Some(format!("Run {}: {message}", state.label()))
        }
    }
}

/// Build a text summary from a finished run record.
pub(crate) fn build_text_summary(record: &RunRecord) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Repository: {}", record.repo_url));
    lines.push(format!("Backend:    {}", record.backend_url));
    if let Some(job) = record.job_id.as_ref() {
        lines.push(format!("Job:        {job}"));
    }
    lines.push(format!("State:      {}", record.state.label()));

    if record.poll_attempts > 0 {
        let waited = record
            .poll_duration
            .map(|d| format!(" over {}", humantime::format_duration(round_secs(d))))
            .unwrap_or_default();
        lines.push(format!(
            "Polls:      {}{}",
            record.poll_attempts, waited
        ));
    }
    if let Some(bytes) = record.svg_bytes {
        let size = match (record.width_px, record.height_px) {
            (Some(w), Some(h)) => format!(", {w}x{h} px"),
            _ => String::new(),
        };
        lines.push(format!("Image:      SVG {bytes} bytes{size}"));
    }
    for path in &record.exported {
        lines.push(format!("Exported:   {path}"));
    }
    if let Some(err) = record.error.as_deref() {
        lines.push(format!("Error:      {err}"));
    }

    TextSummary { lines }
}

fn round_secs(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(d.as_secs())
}
