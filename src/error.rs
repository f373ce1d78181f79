//! Error taxonomy for a run.
//!
//! Engine, backend, renderer and export code return [`ClientError`]; presentation layers
//! wrap it in `anyhow` with context.

use crate::model::JobId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The repository URL was empty after trimming. No request is sent.
    #[error("repository URL must not be empty")]
    EmptyRepositoryUrl,

    /// The backend base URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The request could not be sent or the response could not be read.
    #[error("network error: {0}")]
    Network(String),

    /// The backend answered with a non-success status.
    #[error("backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },

    /// A result was requested before the job finished.
    #[error("job {job_id} is not ready yet")]
    NotReady { job_id: JobId },

    /// The backend response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// The graph description is malformed or the renderer failed.
    #[error("render failed: {0}")]
    Render(String),

    #[error("job {job_id} not ready after {}s", .elapsed.as_secs())]
    PollTimeout { job_id: JobId, elapsed: Duration },

    #[error("giving up on job {job_id} after {failures} consecutive failures: {last}")]
    TooManyFailures {
        job_id: JobId,
        failures: u32,
        last: Box<ClientError>,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("export failed: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Build a `Backend` error from a non-success response, keeping the body as message.
    pub async fn from_response(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|_| "failed to read response text".to_string());
        ClientError::Backend { status, message }
    }

    /// Failures worth retrying while polling: the network and 5xx answers.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ClientError::Decode(e.to_string());
        }
        if let Some(status) = e.status() {
            return ClientError::Backend {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        ClientError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_covers_network_and_server_errors_only() {
        assert!(ClientError::Network("reset".into()).is_transient());
        assert!(ClientError::Backend {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!ClientError::Backend {
            status: 404,
            message: String::new()
        }
        .is_transient());
        assert!(!ClientError::Render("bad".into()).is_transient());
        assert!(!ClientError::Cancelled.is_transient());
    }

    #[test]
    fn timeout_message_reports_elapsed_seconds() {
        let e = ClientError::PollTimeout {
            job_id: JobId::from("abc"),
            elapsed: Duration::from_secs(90),
        };
        assert_eq!(e.to_string(), "job abc not ready after 90s");
    }
}
