use crate::backend::Backend;
use crate::error::{ClientError, Result};
use crate::model::{GraphDescription, InfoEvent, JobId, PollPolicy, RunEvent};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Parameters for a status polling loop.
pub(crate) struct PollParams<'a> {
    pub backend: &'a dyn Backend,
    pub job_id: &'a JobId,
    pub policy: &'a PollPolicy,
    pub event_tx: &'a mpsc::UnboundedSender<RunEvent>,
    pub cancel: watch::Receiver<bool>,
}

/// Status queries made so far and the time spent waiting for the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Resolve once the cancel flag is raised. Never resolves if the sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Waits for one job to become ready and fetches its graph, all within `policy.timeout`.
///
/// Not-ready answers wait the fixed interval. Transient failures back off and count
/// towards `max_consecutive_failures`; anything else aborts. Requests are raced against
/// the deadline, except the final check at the deadline which gets one interval.
pub(crate) struct Poller<'a> {
    backend: &'a dyn Backend,
    job_id: &'a JobId,
    policy: &'a PollPolicy,
    event_tx: &'a mpsc::UnboundedSender<RunEvent>,
    cancel: watch::Receiver<bool>,
    start: Instant,
    deadline: Instant,
    report: PollReport,
}

impl<'a> Poller<'a> {
    pub fn new(params: PollParams<'a>) -> Self {
        let start = Instant::now();
        Self {
            backend: params.backend,
            job_id: params.job_id,
            policy: params.policy,
            event_tx: params.event_tx,
            cancel: params.cancel,
            start,
            deadline: start + params.policy.timeout,
            report: PollReport::default(),
        }
    }

    /// Progress so far. Valid after success and after failure.
    pub fn report(&self) -> PollReport {
        self.report
    }

    /// Query job status until the backend reports ready.
    pub async fn poll_status(&mut self) -> Result<()> {
        let res = self.poll_loop().await;
        self.report.elapsed = self.start.elapsed();
        res
    }

    async fn poll_loop(&mut self) -> Result<()> {
        let backend = self.backend;
        let job_id = self.job_id;
        let mut cancel = self.cancel.clone();
        let mut failures = 0u32;

        loop {
            if *self.cancel.borrow() {
                return Err(ClientError::Cancelled);
            }
            self.report.attempts += 1;
            let attempts = self.report.attempts;

            let cutoff = self.request_cutoff();
            let res = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(ClientError::Cancelled),
                r = backend.status(job_id) => r,
                _ = tokio::time::sleep_until(cutoff) => return Err(self.timed_out()),
            };

            let (delay, failure) = match res {
                Ok(status) if status.ready => {
                    debug!(%job_id, attempts, "job ready");
                    let _ = self.event_tx.send(RunEvent::PollAttempt {
                        job_id: job_id.clone(),
                        attempt: attempts,
                        ready: true,
                        failure: None,
                        next_delay: None,
                    });
                    return Ok(());
                }
                Ok(_) => {
                    failures = 0;
                    (self.policy.delay_after(0), None)
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    let text = e.to_string();
                    self.check_failures(failures, e)?;
                    (with_jitter(self.policy.delay_after(failures)), Some(text))
                }
                Err(e) => return Err(e),
            };

            let delay = self.clamp_delay(delay)?;
            debug!(%job_id, attempts, ?delay, "job not ready");
            let _ = self.event_tx.send(RunEvent::PollAttempt {
                job_id: job_id.clone(),
                attempt: attempts,
                ready: false,
                failure,
                next_delay: Some(delay),
            });
            self.sleep(delay).await?;
        }
    }

    /// Fetch the graph description of a ready job. Some backends flag a job done before
    /// the description file exists, so `NotReady` keeps retrying until the deadline.
    pub async fn fetch_graph(&mut self) -> Result<GraphDescription> {
        let backend = self.backend;
        let job_id = self.job_id;
        let mut cancel = self.cancel.clone();
        let mut failures = 0u32;

        loop {
            let cutoff = self.request_cutoff();
            let res = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(ClientError::Cancelled),
                r = backend.fetch_graph(job_id) => r,
                _ = tokio::time::sleep_until(cutoff) => return Err(self.timed_out()),
            };

            let delay = match res {
                Ok(description) => return Ok(description),
                Err(ClientError::NotReady { .. }) => {
                    failures = 0;
                    self.policy.delay_after(0)
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    self.check_failures(failures, e)?;
                    with_jitter(self.policy.delay_after(failures))
                }
                Err(e) => return Err(e),
            };

            let delay = self.clamp_delay(delay)?;
            debug!(%job_id, ?delay, "graph not available yet");
            let _ = self.event_tx.send(RunEvent::Info(InfoEvent::Message(format!(
                "Graph for job {} not available yet, retrying in {:.1}s",
                job_id.short(),
                delay.as_secs_f64()
            ))));
            self.sleep(delay).await?;
        }
    }

    fn check_failures(&self, failures: u32, last: ClientError) -> Result<()> {
        if failures > self.policy.max_consecutive_failures {
            return Err(ClientError::TooManyFailures {
                job_id: self.job_id.clone(),
                failures,
                last: Box::new(last),
            });
        }
        warn!(job_id = %self.job_id, failures, error = %last, "request failed, retrying");
        Ok(())
    }

    /// Latest instant a request may run: the deadline, or one interval for the final check.
    fn request_cutoff(&self) -> Instant {
        self.deadline.max(Instant::now() + self.policy.interval)
    }

    fn timed_out(&self) -> ClientError {
        ClientError::PollTimeout {
            job_id: self.job_id.clone(),
            elapsed: self.start.elapsed(),
        }
    }

    /// Fail at the deadline; otherwise shorten `delay` so the final check lands on it.
    fn clamp_delay(&self, delay: Duration) -> Result<Duration> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(self.timed_out());
        }
        Ok(delay.min(self.deadline - now))
    }

    async fn sleep(&mut self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancelled(&mut self.cancel) => Err(ClientError::Cancelled),
        }
    }
}

/// Spread retries by ±10 %.
fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;

    fn policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(60),
            max_consecutive_failures: 3,
        }
    }

    async fn poll(
        backend: &ScriptedBackend,
        policy: &PollPolicy,
        cancel: watch::Receiver<bool>,
    ) -> (Result<PollReport>, Vec<RunEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job_id = JobId::from("job-1");
        let mut poller = Poller::new(PollParams {
            backend,
            job_id: &job_id,
            policy,
            event_tx: &tx,
            cancel,
        });
        let res = poller.poll_status().await.map(|()| poller.report());
        drop(poller);
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (res, events)
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_ready_after_many_not_ready() {
        let backend = ScriptedBackend::new().with_statuses(&[false; 12]).with_statuses(&[true]);
        let (_tx, rx) = watch::channel(false);
        let (res, events) = poll(&backend, &policy(), rx).await;

        let report = res.unwrap();
        assert_eq!(report.attempts, 13);
        assert!(report.elapsed >= Duration::from_secs(24));
        assert!(report.elapsed < Duration::from_secs(25));
        assert_eq!(backend.status_calls(), 13);
        let ready_events = events
            .iter()
            .filter(|e| matches!(e, RunEvent::PollAttempt { ready: true, .. }))
            .count();
        assert_eq!(ready_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let backend = ScriptedBackend::new()
            .with_status_error(ClientError::Network("connection reset".into()))
            .with_status_error(ClientError::Backend {
                status: 502,
                message: "bad gateway".into(),
            })
            .with_statuses(&[false, true]);
        let (_tx, rx) = watch::channel(false);
        let (res, events) = poll(&backend, &policy(), rx).await;

        assert_eq!(res.unwrap().attempts, 4);
        let failures: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::PollAttempt {
                    failure: Some(f), ..
                } => Some(f.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_resets_failure_count() {
        let mut backend = ScriptedBackend::new();
        for _ in 0..3 {
            backend = backend
                .with_status_error(ClientError::Network("flaky".into()))
                .with_status_error(ClientError::Network("flaky".into()))
                .with_statuses(&[false]);
        }
        let backend = backend.with_statuses(&[true]);
        let (_tx, rx) = watch::channel(false);
        let (res, _) = poll(&backend, &policy(), rx).await;
        assert_eq!(res.unwrap().attempts, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_too_many_consecutive_failures() {
        let mut backend = ScriptedBackend::new();
        for _ in 0..4 {
            backend = backend.with_status_error(ClientError::Network("down".into()));
        }
        let (_tx, rx) = watch::channel(false);
        let (res, _) = poll(&backend, &policy(), rx).await;

        match res {
            Err(ClientError::TooManyFailures { failures, .. }) => assert_eq!(failures, 4),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(backend.status_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_abort_immediately() {
        let backend = ScriptedBackend::new().with_status_error(ClientError::Backend {
            status: 404,
            message: "unknown job".into(),
        });
        let (_tx, rx) = watch::channel(false);
        let (res, _) = poll(&backend, &policy(), rx).await;

        assert!(matches!(
            res,
            Err(ClientError::Backend { status: 404, .. })
        ));
        assert_eq!(backend.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let backend = ScriptedBackend::new();
        let policy = PollPolicy {
            timeout: Duration::from_secs(9),
            ..policy()
        };
        let (_tx, rx) = watch::channel(false);
        let (res, _) = poll(&backend, &policy, rx).await;

        match res {
            Err(ClientError::PollTimeout { elapsed, .. }) => {
                assert!(elapsed >= Duration::from_secs(9))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // t = 0, 2, 4, 6, 8 and a final check at the deadline.
        assert_eq!(backend.status_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_waiting() {
        let backend = std::sync::Arc::new(ScriptedBackend::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let b = backend.clone();
        let task = tokio::spawn(async move {
            let (tx, _rx) = mpsc::unbounded_channel();
            let job_id = JobId::from("job-1");
            let policy = policy();
            Poller::new(PollParams {
                backend: &*b,
                job_id: &job_id,
                policy: &policy,
                event_tx: &tx,
                cancel: cancel_rx,
            })
            .poll_status()
            .await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel_tx.send(true).unwrap();
        let res = task.await.unwrap();

        assert!(matches!(res, Err(ClientError::Cancelled)));
        assert_eq!(backend.status_calls(), 3);
    }

    #[tokio::test]
    async fn already_cancelled_never_queries() {
        let backend = ScriptedBackend::new().with_statuses(&[true]);
        let (_tx, rx) = watch::channel(true);
        let (res, _) = poll(&backend, &policy(), rx).await;
        assert!(matches!(res, Err(ClientError::Cancelled)));
        assert_eq!(backend.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_status_request_is_cut_at_deadline() {
        let backend = ScriptedBackend::new()
            .with_status_delay(Duration::from_secs(30))
            .with_statuses(&[true]);
        let policy = PollPolicy {
            timeout: Duration::from_secs(9),
            ..policy()
        };
        let (_tx, rx) = watch::channel(false);
        let (res, _) = poll(&backend, &policy, rx).await;

        match res {
            Err(ClientError::PollTimeout { elapsed, .. }) => {
                assert!(elapsed >= Duration::from_secs(9));
                assert!(elapsed < Duration::from_secs(10));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(backend.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn report_keeps_attempts_after_timeout() {
        let backend = ScriptedBackend::new();
        let policy = PollPolicy {
            timeout: Duration::from_secs(9),
            ..policy()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let job_id = JobId::from("job-1");
        let mut poller = Poller::new(PollParams {
            backend: &backend,
            job_id: &job_id,
            policy: &policy,
            event_tx: &tx,
            cancel: cancel_rx,
        });

        assert!(poller.poll_status().await.is_err());
        let report = poller.report();
        assert_eq!(report.attempts, 6);
        assert!(report.elapsed >= Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn graph_missing_right_after_ready_is_retried() {
        let backend = ScriptedBackend::new().with_graph_after(2, "digraph { a -> b }");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let job_id = JobId::from("job-1");
        let policy = policy();
        let mut poller = Poller::new(PollParams {
            backend: &backend,
            job_id: &job_id,
            policy: &policy,
            event_tx: &tx,
            cancel: cancel_rx,
        });

        let graph = poller.fetch_graph().await.unwrap();
        assert!(graph.text.contains("a -> b"));
        assert_eq!(backend.fetch_calls(), 3);
        drop(poller);
        drop(tx);
        let mut retries = 0;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, RunEvent::Info(InfoEvent::Message(ref m)) if m.contains("not available yet")) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn graph_that_never_appears_times_out() {
        let backend = ScriptedBackend::new().with_graph_after(u32::MAX, "digraph { a }");
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let job_id = JobId::from("job-1");
        let policy = PollPolicy {
            timeout: Duration::from_secs(9),
            ..policy()
        };
        let mut poller = Poller::new(PollParams {
            backend: &backend,
            job_id: &job_id,
            policy: &policy,
            event_tx: &tx,
            cancel: cancel_rx,
        });

        let res = poller.fetch_graph().await;
        assert!(matches!(res, Err(ClientError::PollTimeout { .. })));
        assert_eq!(backend.fetch_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn graph_fetch_server_errors_back_off_then_give_up() {
        let mut backend = ScriptedBackend::new();
        for _ in 0..4 {
            backend = backend.with_graph_error(ClientError::Backend {
                status: 503,
                message: "unavailable".into(),
            });
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let job_id = JobId::from("job-1");
        let policy = policy();
        let mut poller = Poller::new(PollParams {
            backend: &backend,
            job_id: &job_id,
            policy: &policy,
            event_tx: &tx,
            cancel: cancel_rx,
        });

        let res = poller.fetch_graph().await;
        assert!(matches!(
            res,
            Err(ClientError::TooManyFailures { failures: 4, .. })
        ));
    }
}
