//! Remote analysis backend.
//!
//! The backend owns job execution; the client only submits, polls and downloads results.

mod http;

pub use http::HttpBackend;

use crate::error::Result;
use crate::model::{ArtifactKind, GraphDescription, JobId, JobStatus};
use async_trait::async_trait;

#[async_trait]
pub trait Backend: Send + Sync {
    /// `POST /run?repo_url=<url>`.
    async fn submit(&self, repo_url: &str) -> Result<JobId>;

    /// `GET /status/<job_id>`.
    async fn status(&self, job_id: &JobId) -> Result<JobStatus>;

    /// `GET /result/<job_id>/dot`.
    async fn fetch_graph(&self, job_id: &JobId) -> Result<GraphDescription>;

    /// `GET /result/<job_id>/<kind>`, raw bytes.
    async fn fetch_artifact(&self, job_id: &JobId, kind: ArtifactKind) -> Result<Vec<u8>>;
}
