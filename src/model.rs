use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub backend_url: String,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub poll: PollPolicy,
    pub renderer_command: String,
}

/// Polling behaviour for a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay between status queries while the job is not ready.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound for the backoff delay after consecutive failures.
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    /// Give up when the job is still not ready after this long.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive transient failures tolerated before giving up.
    pub max_consecutive_failures: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(600),
            max_consecutive_failures: 5,
        }
    }
}

impl PollPolicy {
    /// Delay before the next attempt. Not-ready answers wait the fixed interval; after
    /// `failures` consecutive transient failures the interval doubles per failure, capped
    /// at `max_interval`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let factor = 2u32.saturating_pow(failures.min(16));
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
            .max(self.interval)
    }
}

/// Opaque job identifier handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in file names and status lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// `short()` reduced to `[A-Za-z0-9_-]`, safe to embed in a file name.
    pub fn file_stem(&self) -> String {
        self.short()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of `POST /run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

/// Body of `GET /status/<job_id>`. Backends report either `ready` or `done`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatus {
    #[serde(alias = "done")]
    pub ready: bool,
}

/// DOT text produced for a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub job_id: JobId,
    pub text: String,
}

/// Result files a backend keeps per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Dot,
    Arch,
    Type,
    Snippets,
    Edges,
    Png,
}

impl ArtifactKind {
    /// Path segment under `/result/<job_id>/`.
    pub fn as_path_segment(self) -> &'static str {
        match self {
            ArtifactKind::Dot => "dot",
            ArtifactKind::Arch => "arch",
            ArtifactKind::Type => "type",
            ArtifactKind::Snippets => "snippets",
            ArtifactKind::Edges => "edges",
            ArtifactKind::Png => "png",
        }
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            ArtifactKind::Dot => "dot",
            ArtifactKind::Png => "png",
            _ => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Submitted,
    Polling,
    Ready,
    Rendered,
    Error,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Rendered | RunState::Error | RunState::Cancelled
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Submitted => "submitted",
            RunState::Polling => "polling",
            RunState::Ready => "ready",
            RunState::Rendered => "rendered",
            RunState::Error => "error",
            RunState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    StateChanged {
        state: RunState,
        job_id: Option<JobId>,
    },
    PollAttempt {
        job_id: JobId,
        attempt: u32,
        ready: bool,
        failure: Option<String>,
        next_delay: Option<Duration>,
    },
    Info(InfoEvent),
    RunCompleted {
        // Boxed: the rendered SVG can be large.
        outcome: Box<RunOutcome>,
    },
    RunFailed {
        repo_url: String,
        job_id: Option<JobId>,
        state: RunState,
        message: String,
    },
}

/// Structured info events emitted by the engine and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    Submitting { repo_url: String },
    Rendering { bytes: usize },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Submitting { repo_url } => format!("Submitting {repo_url}"),
            InfoEvent::Rendering { bytes } => {
                format!("Rendering graph description ({bytes} bytes)")
            }
        }
    }
}

/// Everything a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub repo_url: String,
    pub job_id: JobId,
    pub poll_attempts: u32,
    pub poll_duration: Duration,
    pub image: crate::render::RenderedImage,
}

/// Persisted summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(default)]
    pub timestamp_utc: String,
    pub backend_url: String,
    pub repo_url: String,
    pub job_id: Option<JobId>,
    pub state: RunState,
    #[serde(default)]
    pub poll_attempts: u32,
    #[serde(default, with = "humantime_serde")]
    pub poll_duration: Option<Duration>,
    #[serde(default)]
    pub svg_bytes: Option<usize>,
    #[serde(default)]
    pub width_px: Option<u32>,
    #[serde(default)]
    pub height_px: Option<u32>,
    #[serde(default)]
    pub exported: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_accepts_ready_and_done() {
        let a: JobStatus = serde_json::from_str(r#"{"ready": true}"#).unwrap();
        let b: JobStatus = serde_json::from_str(r#"{"done": false}"#).unwrap();
        assert!(a.ready);
        assert!(!b.ready);
    }

    #[test]
    fn backoff_doubles_per_failure_and_caps() {
        let policy = PollPolicy {
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(15),
            ..Default::default()
        };
        assert_eq!(policy.delay_after(0), Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(4));
        assert_eq!(policy.delay_after(2), Duration::from_secs(8));
        assert_eq!(policy.delay_after(3), Duration::from_secs(15));
        assert_eq!(policy.delay_after(40), Duration::from_secs(15));
    }

    #[test]
    fn short_job_id_truncates_to_eight_chars() {
        let id = JobId::from("0f8fad5b-d9cb-469f-a165-70867728950e");
        assert_eq!(id.short(), "0f8fad5b");
        assert_eq!(JobId::from("abc").short(), "abc");
    }

    #[test]
    fn file_stem_strips_path_characters() {
        assert_eq!(JobId::from("../../evil").file_stem(), "______ev");
        assert_eq!(JobId::from("/tmp/zz").file_stem(), "_tmp_zz");
        assert_eq!(JobId::from("0f8fad5b-d9cb").file_stem(), "0f8fad5b");
    }

    #[test]
    fn record_round_trips_optional_duration() {
        let rec = RunRecord {
            timestamp_utc: "2024-01-01T00:00:00Z".into(),
            backend_url: "http://localhost:8000".into(),
            repo_url: "https://github.com/a/b".into(),
            job_id: Some(JobId::from("j1")),
            state: RunState::Rendered,
            poll_attempts: 3,
            poll_duration: Some(Duration::from_secs(6)),
            svg_bytes: Some(10),
            width_px: None,
            height_px: None,
            exported: vec![],
            error: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"poll_duration\":\"6s\""));
        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.poll_duration, Some(Duration::from_secs(6)));
        assert_eq!(back.state, RunState::Rendered);
    }
}
