// ABOUTME: Named background jobs bound to a shared shutdown signal
// ABOUTME: Each job runs once and reports its terminal result when joined

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::health::{Health, HealthReporter, TracingHealth};

/// Cancellation signal handed to every job. A received message or a closed
/// channel both mean "stop".
pub type Shutdown = broadcast::Receiver<()>;

/// Terminal outcome of one job.
#[derive(Debug)]
pub struct JobResult {
    pub name: String,
    pub result: Result<()>,
}

/// A group of one-shot background jobs sharing one shutdown signal and one
/// health reporter.
pub struct JobGroup {
    shutdown: broadcast::Sender<()>,
    reporter: Arc<dyn HealthReporter>,
    jobs: JoinSet<JobResult>,
    stopped: bool,
}

impl JobGroup {
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(TracingHealth))
    }

    pub fn with_reporter(reporter: Arc<dyn HealthReporter>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shutdown,
            reporter,
            jobs: JoinSet::new(),
            stopped: false,
        }
    }

    /// Starts `job` on the tokio runtime. The job receives its own shutdown
    /// receiver and a health handle named after it. Jobs added after
    /// [`JobGroup::shutdown`] are not started.
    pub fn add_oneshot<F, Fut>(&mut self, name: impl Into<String>, job: F)
    where
        F: FnOnce(Shutdown, Health) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.stopped {
            tracing::warn!(job = %name, "job group already stopped; not starting job");
            return;
        }

        let health = Health::new(name.clone(), Arc::clone(&self.reporter));
        let fut = job(self.shutdown.subscribe(), health);
        tracing::debug!(job = %name, "starting job");
        self.jobs.spawn(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("job {name} panicked")),
            };
            match &result {
                Ok(()) => tracing::debug!(job = %name, "job finished"),
                Err(err) => tracing::error!(job = %name, "job failed: {:#}", err),
            }
            JobResult { name, result }
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Waits for the next job to finish on its own. Returns `None` when no jobs
    /// are running. Cancel safe.
    pub async fn join_next(&mut self) -> Option<JobResult> {
        loop {
            match self.jobs.join_next().await? {
                Ok(result) => return Some(result),
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    return Some(JobResult {
                        name: "<unknown>".to_string(),
                        result: Err(anyhow!("job task failed: {err}")),
                    })
                }
            }
        }
    }

    /// Signals shutdown to every job and waits for all of them to return.
    pub async fn shutdown(&mut self) -> Vec<JobResult> {
        self.stopped = true;
        // No receivers simply means no jobs are running.
        let _ = self.shutdown.send(());

        let mut results = Vec::new();
        while let Some(result) = self.join_next().await {
            results.push(result);
        }
        results
    }
}

impl Default for JobGroup {
    fn default() -> Self {
        Self::new()
    }
}
