use super::Backend;
use crate::error::{ClientError, Result};
use crate::model::{ArtifactKind, GraphDescription, JobId, JobStatus, RunConfig, SubmitResponse};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::debug;

/// reqwest client for the backend's HTTP surface.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| ClientError::Network(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: parse_base_url(&cfg.backend_url)?,
        })
    }

    pub fn run_url(&self, repo_url: &str) -> Result<Url> {
        let mut url = self.join(&["run"])?;
        url.query_pairs_mut().append_pair("repo_url", repo_url);
        Ok(url)
    }

    pub fn status_url(&self, job_id: &JobId) -> Result<Url> {
        self.join(&["status", job_id.as_str()])
    }

    pub fn result_url(&self, job_id: &JobId, kind: ArtifactKind) -> Result<Url> {
        self.join(&["result", job_id.as_str(), kind.as_path_segment()])
    }

    fn join(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_result(&self, job_id: &JobId, kind: ArtifactKind) -> Result<reqwest::Response> {
        let url = self.result_url(job_id, kind)?;
        debug!(%url, "fetching result");
        let resp = self.http.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotReady {
                job_id: job_id.clone(),
            });
        }
        if !resp.status().is_success() {
            return Err(ClientError::from_response(resp).await);
        }
        Ok(resp)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn submit(&self, repo_url: &str) -> Result<JobId> {
        let url = self.run_url(repo_url)?;
        debug!(%url, "submitting job");
        let resp = self.http.post(url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::from_response(resp).await);
        }
        let body: SubmitResponse = resp.json().await?;
        if body.job_id.as_str().is_empty() {
            return Err(ClientError::Decode("backend returned an empty job_id".into()));
        }
        Ok(body.job_id)
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        let url = self.status_url(job_id)?;
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ClientError::from_response(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn fetch_graph(&self, job_id: &JobId) -> Result<GraphDescription> {
        let text = self.get_result(job_id, ArtifactKind::Dot).await?.text().await?;
        Ok(GraphDescription {
            job_id: job_id.clone(),
            text,
        })
    }

    async fn fetch_artifact(&self, job_id: &JobId, kind: ArtifactKind) -> Result<Vec<u8>> {
        let bytes = self.get_result(job_id, kind).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| ClientError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::InvalidUrl(format!(
            "{raw}: scheme must be http or https"
        )));
    }
    if url.cannot_be_a_base() {
        return Err(ClientError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}
