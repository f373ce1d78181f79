mod poll;

use crate::backend::Backend;
use crate::error::{ClientError, Result};
use crate::model::{GraphDescription, InfoEvent, JobId, PollPolicy, RunEvent, RunOutcome, RunState};
use crate::render::{RenderedImage, Renderer};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub(crate) use poll::cancelled;
pub use poll::PollReport;

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Abandon the run at the next await point
    Cancel,
}

/// A failed run, with the job id when the backend had already accepted it.
#[derive(Debug)]
pub struct RunError {
    pub job_id: Option<JobId>,
    pub error: ClientError,
    /// Status polling done before the failure.
    pub poll: PollReport,
}

impl RunError {
    fn before_submit(error: ClientError) -> Self {
        Self {
            job_id: None,
            error,
            poll: PollReport::default(),
        }
    }
}

/// Drives one run: submit, poll, fetch, render.
pub struct RunEngine {
    backend: Arc<dyn Backend>,
    renderer: Arc<dyn Renderer>,
    policy: PollPolicy,
}

impl RunEngine {
    pub fn new(backend: Arc<dyn Backend>, renderer: Arc<dyn Renderer>, policy: PollPolicy) -> Self {
        Self {
            backend,
            renderer,
            policy,
        }
    }

    /// Validate the URL and start a backend job. An empty URL never reaches the backend.
    pub async fn submit(&self, repo_url: &str) -> Result<JobId> {
        let repo_url = repo_url.trim();
        if repo_url.is_empty() {
            return Err(ClientError::EmptyRepositoryUrl);
        }
        self.backend.submit(repo_url).await
    }

    pub async fn render_graph(&self, description: &GraphDescription) -> Result<RenderedImage> {
        self.renderer.render_svg(description).await
    }

    /// Run the whole pipeline. State changes and poll progress go to `event_tx`.
    pub async fn run(
        self,
        repo_url: String,
        event_tx: mpsc::UnboundedSender<RunEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> std::result::Result<RunOutcome, RunError> {
        let repo_url = repo_url.trim().to_string();
        if repo_url.is_empty() {
            return Err(RunError::before_submit(ClientError::EmptyRepositoryUrl));
        }

        // Control listener.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let control_handle = tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
                match msg {
                    EngineControl::Cancel => {
                        let _ = cancel_tx.send(true);
                        break;
                    }
                }
            }
            // Keep the sender alive so receivers never see a closed channel as a cancel.
            futures::future::pending::<()>().await;
        });

        let res = self.drive(&repo_url, &event_tx, cancel_rx).await;

        // Dropping a JoinHandle does not stop the task.
        control_handle.abort();
        res
    }

    async fn drive(
        &self,
        repo_url: &str,
        event_tx: &mpsc::UnboundedSender<RunEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> std::result::Result<RunOutcome, RunError> {
        let _ = event_tx.send(RunEvent::Info(InfoEvent::Submitting {
            repo_url: repo_url.to_string(),
        }));
        let job_id = tokio::select! {
            r = self.submit(repo_url) => r.map_err(RunError::before_submit)?,
            _ = cancelled(&mut cancel) => return Err(RunError::before_submit(ClientError::Cancelled)),
        };
        info!(%job_id, repo_url, "job submitted");
        let failed = |error: ClientError, poll: PollReport| RunError {
            job_id: Some(job_id.clone()),
            error,
            poll,
        };
        emit_state(event_tx, RunState::Submitted, Some(&job_id));

        emit_state(event_tx, RunState::Polling, Some(&job_id));
        let mut poller = poll::Poller::new(poll::PollParams {
            backend: self.backend.as_ref(),
            job_id: &job_id,
            policy: &self.policy,
            event_tx,
            cancel: cancel.clone(),
        });
        let ready = poller.poll_status().await;
        let report = poller.report();
        ready.map_err(|e| failed(e, report))?;
        info!(%job_id, poll_attempts = report.attempts, "job ready");
        emit_state(event_tx, RunState::Ready, Some(&job_id));

        let description = poller.fetch_graph().await.map_err(|e| failed(e, report))?;
        drop(poller);
        let _ = event_tx.send(RunEvent::Info(InfoEvent::Rendering {
            bytes: description.text.len(),
        }));
        let image = tokio::select! {
            r = self.render_graph(&description) => r.map_err(|e| failed(e, report))?,
            _ = cancelled(&mut cancel) => return Err(failed(ClientError::Cancelled, report)),
        };
        emit_state(event_tx, RunState::Rendered, Some(&job_id));

        Ok(RunOutcome {
            repo_url: repo_url.to_string(),
            job_id,
            poll_attempts: report.attempts,
            poll_duration: report.elapsed,
            image,
        })
    }
}

fn emit_state(tx: &mpsc::UnboundedSender<RunEvent>, state: RunState, job_id: Option<&JobId>) {
    let _ = tx.send(RunEvent::StateChanged {
        state,
        job_id: job_id.cloned(),
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::render::check_description;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Deterministic renderer: wraps the description in a fixed SVG envelope.
    #[derive(Default)]
    pub(crate) struct FakeRenderer {
        pub renders: AtomicU32,
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render_svg(&self, description: &GraphDescription) -> Result<RenderedImage> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            check_description(&description.text)?;
            Ok(RenderedImage {
                source: description.clone(),
                svg: format!(
                    "<svg width=\"75pt\" height=\"30pt\"><!-- {} --></svg>\n",
                    description.text.len()
                ),
            })
        }

        async fn rasterize_png(&self, image: &RenderedImage) -> Result<Vec<u8>> {
            let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
            png.extend_from_slice(image.svg.as_bytes());
            Ok(png)
        }
    }

    pub(crate) fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(120),
            max_consecutive_failures: 3,
        }
    }

    fn engine(backend: Arc<ScriptedBackend>) -> RunEngine {
        RunEngine::new(backend, Arc::new(FakeRenderer::default()), fast_policy())
    }

    fn states(events: &[RunEvent]) -> Vec<RunState> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    async fn run(
        backend: Arc<ScriptedBackend>,
        repo_url: &str,
    ) -> (std::result::Result<RunOutcome, RunError>, Vec<RunEvent>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let res = engine(backend).run(repo_url.into(), event_tx, ctrl_rx).await;
        let mut events = Vec::new();
        while let Ok(ev) = event_rx.try_recv() {
            events.push(ev);
        }
        (res, events)
    }

    #[tokio::test]
    async fn empty_url_never_reaches_backend() {
        let backend = Arc::new(ScriptedBackend::new());
        let (res, events) = run(backend.clone(), "   ").await;

        let err = res.unwrap_err();
        assert!(matches!(err.error, ClientError::EmptyRepositoryUrl));
        assert!(err.job_id.is_none());
        assert_eq!(backend.submit_calls(), 0);
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn walks_states_in_order() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_job("job-42")
                .with_statuses(&[false, false, true])
                .with_graph("digraph { api -> db }"),
        );
        let (res, events) = run(backend.clone(), " https://github.com/org/repo ").await;

        let outcome = res.unwrap();
        assert_eq!(outcome.job_id.as_str(), "job-42");
        assert_eq!(outcome.repo_url, "https://github.com/org/repo");
        assert_eq!(outcome.poll_attempts, 3);
        assert_eq!(outcome.image.job_id().as_str(), "job-42");
        assert_eq!(
            states(&events),
            vec![
                RunState::Submitted,
                RunState::Polling,
                RunState::Ready,
                RunState::Rendered
            ]
        );
        assert_eq!(backend.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn server_error_on_submit_surfaces() {
        let backend = Arc::new(ScriptedBackend::new().with_submit_error(ClientError::Backend {
            status: 500,
            message: "Internal Server Error".into(),
        }));
        let (res, events) = run(backend.clone(), "https://github.com/org/repo").await;

        let err = res.unwrap_err();
        assert!(matches!(err.error, ClientError::Backend { status: 500, .. }));
        assert_eq!(backend.status_calls(), 0);
        assert!(states(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_graph_is_a_render_error() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_job("job-1")
                .with_statuses(&[true])
                .with_graph("<html>502 Bad Gateway</html>"),
        );
        let (res, events) = run(backend, "https://github.com/org/repo").await;

        let err = res.unwrap_err();
        assert!(matches!(err.error, ClientError::Render(_)));
        assert_eq!(err.job_id.unwrap().as_str(), "job-1");
        assert!(!states(&events).contains(&RunState::Rendered));
    }

    #[tokio::test]
    async fn render_is_idempotent() {
        let e = engine(Arc::new(ScriptedBackend::new()));
        let description = GraphDescription {
            job_id: JobId::from("j"),
            text: "digraph { a -> b }".into(),
        };
        let first = e.render_graph(&description).await.unwrap();
        let second = e.render_graph(&description).await.unwrap();
        assert_eq!(first.svg, second.svg);
    }

    #[tokio::test(start_paused = true)]
    async fn graph_written_after_ready_is_fetched_on_retry() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_job("job-7")
                .with_statuses(&[true])
                .with_graph_after(1, "digraph { a -> b }"),
        );
        let (res, events) = run(backend.clone(), "https://github.com/org/repo").await;

        let outcome = res.unwrap();
        assert_eq!(outcome.job_id.as_str(), "job-7");
        assert_eq!(backend.status_calls(), 1);
        assert_eq!(backend.fetch_calls(), 2);
        assert_eq!(states(&events).last(), Some(&RunState::Rendered));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_keeps_attempt_count() {
        let backend = Arc::new(ScriptedBackend::new().with_job("job-1"));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let policy = PollPolicy {
            timeout: Duration::from_secs(9),
            ..fast_policy()
        };
        let engine = RunEngine::new(backend.clone(), Arc::new(FakeRenderer::default()), policy);
        let err = engine
            .run("https://github.com/org/repo".into(), event_tx, ctrl_rx)
            .await
            .unwrap_err();

        assert!(matches!(err.error, ClientError::PollTimeout { .. }));
        assert_eq!(err.poll.attempts, 6);
        assert_eq!(err.poll.attempts, backend.status_calls());
        assert!(err.poll.elapsed >= Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling() {
        let backend = Arc::new(ScriptedBackend::new().with_job("job-1"));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(engine(backend.clone()).run(
            "https://github.com/org/repo".into(),
            event_tx,
            ctrl_rx,
        ));

        tokio::time::sleep(Duration::from_secs(7)).await;
        ctrl_tx.send(EngineControl::Cancel).unwrap();
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err.error, ClientError::Cancelled));
        assert_eq!(err.job_id.unwrap().as_str(), "job-1");
        assert_eq!(backend.status_calls(), 4);
        assert_eq!(err.poll.attempts, 4);
        assert_eq!(backend.fetch_calls(), 0);
    }
}
