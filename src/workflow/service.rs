// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job submission and caller-side status polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

#[cfg(feature = "telemetry")]
use tracing::debug;

use super::{TerminalResult, Trigger, WorkflowController};
use crate::error::WorkflowError;
use crate::store::{JobRecord, Store};

/// Pre-check run before a job is created, e.g. credit or rate limits.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageGate: Send + Sync {
    /// `Err` carries the reason shown to the caller.
    async fn check(&self, owner_id: &str) -> Result<(), String>;
}

/// Gate that admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl UsageGate for Unlimited {
    async fn check(&self, _owner_id: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Entry point for callers: create jobs and fire their triggers.
pub struct JobService {
    controller: Arc<WorkflowController>,
    usage: Arc<dyn UsageGate>,
}

impl JobService {
    pub fn new(controller: Arc<WorkflowController>) -> Self {
        Self {
            controller,
            usage: Arc::new(Unlimited),
        }
    }

    pub fn with_usage_gate(mut self, usage: Arc<dyn UsageGate>) -> Self {
        self.usage = usage;
        self
    }

    pub fn controller(&self) -> &WorkflowController {
        &self.controller
    }

    fn store(&self) -> &Store {
        self.controller.store()
    }

    /// Create a job with its prompt after the usage check. Returns the job id.
    pub async fn submit(&self, owner_id: &str, project_id: &str, prompt: &str) -> Result<String, WorkflowError> {
        if prompt.trim().is_empty() {
            return Err(WorkflowError::InvalidTrigger("prompt is empty".to_string()));
        }
        self.usage
            .check(owner_id)
            .await
            .map_err(WorkflowError::UsageRejected)?;

        let job = self.store().create_job(owner_id, project_id, prompt)?;
        #[cfg(feature = "telemetry")]
        debug!(job_id = %job.id, project_id, "Job submitted");
        Ok(job.id)
    }

    /// Fire the generate trigger for a job with its stored prompt.
    ///
    /// Also how a failed job is retried: the guard resets `ERROR` jobs.
    pub async fn generate(&self, job_id: &str, cancel: Option<watch::Receiver<bool>>) -> Result<TerminalResult, WorkflowError> {
        let prompt = self.store().job_prompt(job_id)?;
        self.controller.run(Trigger::generate(job_id, prompt), cancel).await
    }

    pub fn record(&self, job_id: &str) -> Result<JobRecord, WorkflowError> {
        Ok(self.store().record(job_id)?)
    }
}

/// Poll a job's status every `interval` until it is terminal or `timeout`
/// passes.
pub async fn wait_for_terminal(
    store: &Store,
    job_id: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<JobRecord, WorkflowError> {
    let start = Instant::now();
    loop {
        let record = store.record(job_id)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        if start.elapsed() >= timeout {
            return Err(WorkflowError::WaitTimeout(job_id.to_string()));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressHub;
    use crate::providers::scripted::ScriptedProvider;
    use crate::sandbox::LocalSandboxProvider;
    use crate::store::{now_millis, JobStatus};
    use crate::workflow::WorkflowSettings;
    use tempfile::tempdir;

    fn service(store: Store, root: &std::path::Path) -> JobService {
        let controller = WorkflowController::new(
            store,
            Arc::new(ScriptedProvider::default()),
            Arc::new(LocalSandboxProvider::new(root)),
            ProgressHub::new(),
            WorkflowSettings::default(),
        );
        JobService::new(Arc::new(controller))
    }

    #[tokio::test]
    async fn test_submit_creates_pending_job() {
        let temp = tempdir().unwrap();
        let service = service(Store::open_in_memory().unwrap(), temp.path());

        let job_id = service.submit("owner", "project", "build a todo list").await.unwrap();
        let record = service.record(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(service.store().job_prompt(&job_id).unwrap(), "build a todo list");
    }

    #[tokio::test]
    async fn test_usage_gate_rejects() {
        let temp = tempdir().unwrap();
        let mut gate = MockUsageGate::new();
        gate.expect_check()
            .times(1)
            .returning(|_| Err("out of credits".to_string()));

        let service = service(Store::open_in_memory().unwrap(), temp.path()).with_usage_gate(Arc::new(gate));
        let result = service.submit("owner", "project", "build").await;
        assert!(matches!(result, Err(WorkflowError::UsageRejected(ref reason)) if reason == "out of credits"));
        assert!(service.store().list_jobs(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let temp = tempdir().unwrap();
        let service = service(Store::open_in_memory().unwrap(), temp.path());
        assert!(matches!(
            service.submit("o", "p", "   ").await,
            Err(WorkflowError::InvalidTrigger(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_terminal_times_out_then_sees_commit() {
        let store = Store::open_in_memory().unwrap();
        let job = store.create_job("o", "p", "x").unwrap();
        let lease = store.claim(&job.id, "run", now_millis() + 60_000).unwrap().unwrap();

        let waited = wait_for_terminal(&store, &job.id, Duration::from_millis(5), Duration::from_millis(20)).await;
        assert!(matches!(waited, Err(WorkflowError::WaitTimeout(_))));

        store.commit_failure(&job.id, &lease).unwrap();
        let record = wait_for_terminal(&store, &job.id, Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Error);
    }
}
