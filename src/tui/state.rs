use crate::model::{JobId, RunEvent, RunOutcome, RunRecord, RunState};
use std::time::{Duration, Instant};

/// Messages kept for the activity pane.
const MAX_LOG_LINES: usize = 200;
/// DOT lines kept for the preview pane.
const MAX_PREVIEW_LINES: usize = 400;

/// Summary of the last rendered graph.
pub struct RenderSummary {
    pub job_id: JobId,
    pub repo_url: String,
    pub svg_bytes: usize,
    pub pixel_size: Option<(u32, u32)>,
    pub dot: String,
    pub dot_preview: Vec<String>,
}

impl RenderSummary {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        let dot = outcome.image.source.text.clone();
        let dot_preview = dot
            .lines()
            .take(MAX_PREVIEW_LINES)
            .map(|l| l.to_string())
            .collect();
        Self {
            job_id: outcome.job_id.clone(),
            repo_url: outcome.repo_url.clone(),
            svg_bytes: outcome.image.svg.len(),
            pixel_size: outcome.image.pixel_size(),
            dot,
            dot_preview,
        }
    }
}

pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub log: Vec<String>,

    // URL input
    pub input: String,
    pub editing: bool,
    pub last_submitted: Option<String>,

    // Active run
    pub run_state: RunState,
    pub job_id: Option<JobId>,
    pub run_start: Option<Instant>,
    pub poll_attempts: u32,
    pub next_check: Option<Duration>,
    pub last_failure: Option<String>,

    pub last_render: Option<RenderSummary>,
    pub preview_scroll: usize,

    pub history: Vec<RunRecord>,
    pub history_selected: usize,
    pub auto_save: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            info: "Press i to enter a repository URL".into(),
            log: Vec::new(),
            input: String::new(),
            editing: false,
            last_submitted: None,
            run_state: RunState::Idle,
            job_id: None,
            run_start: None,
            poll_attempts: 0,
            next_check: None,
            last_failure: None,
            last_render: None,
            preview_scroll: 0,
            history: Vec::new(),
            history_selected: 0,
            auto_save: true,
        }
    }
}

impl UiState {
    pub fn push_log(&mut self, line: String) {
        if self.log.len() >= MAX_LOG_LINES {
            self.log.remove(0);
        }
        self.log.push(line);
    }

    /// Set the status line and keep it in the activity log.
    pub fn set_info(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        self.push_log(msg.clone());
        self.info = msg;
    }

    /// Reset per-run fields when a new submission goes out.
    pub fn begin_run(&mut self, repo_url: &str) {
        self.last_submitted = Some(repo_url.to_string());
        self.run_state = RunState::Idle;
        self.job_id = None;
        self.run_start = Some(Instant::now());
        self.poll_attempts = 0;
        self.next_check = None;
        self.last_failure = None;
    }

    pub fn is_running(&self) -> bool {
        self.run_start.is_some() && !self.run_state.is_terminal()
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.run_start.map(|t| t.elapsed())
    }

    /// Apply an event that needs no access to storage or the CLI.
    pub fn apply_event(&mut self, ev: RunEvent) {
        match ev {
            RunEvent::StateChanged { state, job_id } => {
                self.run_state = state;
                if job_id.is_some() {
                    self.job_id = job_id;
                }
                let msg = match &self.job_id {
                    Some(id) => format!("{} (job {})", state.label(), id.short()),
                    None => state.label().to_string(),
                };
                self.set_info(msg);
            }
            RunEvent::PollAttempt {
                job_id,
                attempt,
                ready,
                failure,
                next_delay,
            } => {
                if self.job_id.as_ref() != Some(&job_id) {
                    self.job_id = Some(job_id);
                }
                self.poll_attempts = attempt;
                self.next_check = if ready { None } else { next_delay };
                if let Some(f) = failure {
                    self.push_log(format!("Poll #{attempt} failed: {f}"));
                    self.last_failure = Some(f);
                } else {
                    self.last_failure = None;
                }
            }
            RunEvent::Info(info) => self.set_info(info.to_message()),
            RunEvent::RunCompleted { outcome } => {
                self.run_state = RunState::Rendered;
                self.job_id = Some(outcome.job_id.clone());
                self.next_check = None;
                self.preview_scroll = 0;
                let summary = RenderSummary::from_outcome(&outcome);
                self.set_info(format!(
                    "Rendered job {} ({} bytes SVG). s: export SVG, p: export PNG",
                    summary.job_id.short(),
                    summary.svg_bytes
                ));
                self.last_render = Some(summary);
            }
            RunEvent::RunFailed {
                repo_url,
                state,
                job_id,
                message,
            } => {
                self.run_state = state;
                if job_id.is_some() {
                    self.job_id = job_id;
                }
                self.next_check = None;
                self.set_info(format!("Run {} for {repo_url}: {message}", state.label()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InfoEvent;

    #[test]
    fn failed_poll_is_logged_and_cleared_on_success() {
        let mut s = UiState::default();
        s.begin_run("https://github.com/org/repo");
        s.apply_event(RunEvent::PollAttempt {
            job_id: JobId::from("j"),
            attempt: 1,
            ready: false,
            failure: Some("network error: timeout".into()),
            next_delay: Some(Duration::from_secs(4)),
        });
        assert_eq!(s.last_failure.as_deref(), Some("network error: timeout"));
        assert_eq!(s.next_check, Some(Duration::from_secs(4)));
        assert_eq!(s.job_id.as_ref().map(|j| j.as_str()), Some("j"));

        s.apply_event(RunEvent::PollAttempt {
            job_id: JobId::from("j"),
            attempt: 2,
            ready: true,
            failure: None,
            next_delay: None,
        });
        assert!(s.last_failure.is_none());
        assert!(s.next_check.is_none());
        assert_eq!(s.poll_attempts, 2);
    }

    #[test]
    fn failure_ends_the_run() {
        let mut s = UiState::default();
        s.begin_run("https://github.com/org/repo");
        assert!(s.is_running());
        s.apply_event(RunEvent::RunFailed {
            repo_url: "https://github.com/org/repo".into(),
            job_id: None,
            state: RunState::Error,
            message: "backend returned HTTP 500: boom".into(),
        });
        assert!(!s.is_running());
        assert!(s.info.contains("HTTP 500"));
        assert!(s.info.contains("https://github.com/org/repo"));
    }

    #[test]
    fn log_is_bounded() {
        let mut s = UiState::default();
        for i in 0..(MAX_LOG_LINES + 5) {
            s.apply_event(RunEvent::Info(InfoEvent::Message(format!("m{i}"))));
        }
        assert_eq!(s.log.len(), MAX_LOG_LINES);
        assert_eq!(s.log.last().unwrap(), &format!("m{}", MAX_LOG_LINES + 4));
    }
}
