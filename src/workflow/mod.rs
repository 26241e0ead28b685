// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable workflow controller.
//!
//! A [`Trigger`] drives one job through a fixed pipeline of checkpointed
//! steps:
//!
//! ```text
//! authorize ─▶ get-sandbox-id ─▶ turn-1, tool-1, turn-2, ... ─▶ generate-title
//!           ─▶ generate-response ─▶ get-sandbox-url ─▶ save-result
//!                        └──────── on fatal error ─────────▶ save-error
//! ```
//!
//! A run that crashes half way is picked up by a later trigger once its
//! lease lapses; the new worker adopts the old run id, so every step that
//! already recorded an output is replayed from the datastore instead of
//! executed again. The takeover moves the lease epoch, so the old worker,
//! if it is still alive, stops at its next step. Exactly one of
//! `save-result` and `save-error` can commit for a job, since both are
//! guarded by the job still being `PENDING` and held under the run's lease.

mod operations;
mod service;
mod signal;
mod step;

pub use operations::{EntryKind, FileOperation};
pub use service::{wait_for_terminal, JobService, Unlimited, UsageGate};
pub use signal::SignalBus;
pub use step::{RetryPolicy, StepContext};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[cfg(feature = "telemetry")]
use tracing::{info, instrument, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use crate::agent::{cancellable, Agent, AgentConfig, Conversation, StepRunner, CODING_PROMPT, RESPONSE_PROMPT, TITLE_PROMPT};
use crate::config::ResolvedConfig;
use crate::error::{AgentError, WorkflowError};
use crate::guard::{Authorization, JobGuard};
use crate::progress::{EventKind, ProgressHub, ProgressReporter};
use crate::sandbox::{sandbox_url, FileMap, SandboxTools, SharedSandboxProvider, APP_PORT};
use crate::store::{
    CommitOutcome, Job, Lease, MessageRole, NewFragment, Store, SuccessRecord, GENERIC_FAILURE_MESSAGE,
};
use crate::types::{Message, SharedProvider};

const PREPARING_SANDBOX: &str = "Preparing sandbox";
const SAVING_RESULT: &str = "Saving result";
const DEFAULT_TITLE: &str = "Fragment";
/// Earlier project messages replayed into a new job's conversation.
const HISTORY_LIMIT: usize = 5;

/// External request to act on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Trigger {
    /// Run the agent for a job. An empty prompt means the job's stored prompt.
    Generate { job_id: String, prompt: String },
    ApplyFileOperations {
        job_id: String,
        operations: Vec<FileOperation>,
    },
    PushFiles { job_id: String, files: FileMap },
}

impl Trigger {
    pub fn generate(job_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::Generate {
            job_id: job_id.into(),
            prompt: prompt.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Generate { job_id, .. }
            | Self::ApplyFileOperations { job_id, .. }
            | Self::PushFiles { job_id, .. } => job_id,
        }
    }
}

/// Why a trigger did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    AlreadyDone,
}

/// What a trigger ended with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TerminalResult {
    Completed {
        job_id: String,
        message_id: String,
        /// Absent when the model answered in plain text.
        fragment_id: Option<String>,
        sandbox_url: Option<String>,
    },
    /// The generic failure message was persisted.
    Failed { job_id: String, message: String },
    Skipped { job_id: String, reason: SkipReason },
    /// Stopped by the caller; the job stays `PENDING`.
    Cancelled { job_id: String },
    FilesUpdated {
        job_id: String,
        fragment_id: String,
        files: usize,
    },
}

impl TerminalResult {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Skipped { job_id, .. }
            | Self::Cancelled { job_id }
            | Self::FilesUpdated { job_id, .. } => job_id,
        }
    }

    fn skipped(job_id: &str, reason: SkipReason) -> Self {
        Self::Skipped {
            job_id: job_id.to_string(),
            reason,
        }
    }
}

/// Tunables for the controller, resolved from configuration.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub coding: AgentConfig,
    pub title: AgentConfig,
    pub response: AgentConfig,
    pub template: String,
    pub idle_timeout: Duration,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
    pub lease_ttl: Duration,
    pub history_limit: usize,
}

impl WorkflowSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            coding: AgentConfig::from_profile(&config.coding, CODING_PROMPT),
            title: AgentConfig::from_profile(&config.narration, TITLE_PROMPT),
            response: AgentConfig::from_profile(&config.narration, RESPONSE_PROMPT),
            template: config.sandbox.template.clone(),
            idle_timeout: Duration::from_millis(config.sandbox.idle_timeout_ms),
            command_timeout: Duration::from_millis(config.sandbox.command_timeout_ms),
            retry: RetryPolicy::from_config(&config.workflow),
            lease_ttl: Duration::from_millis(config.workflow.lease_ttl_ms),
            history_limit: HISTORY_LIMIT,
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_config(&ResolvedConfig::default())
    }
}

/// Drives jobs from trigger to a single terminal outcome.
pub struct WorkflowController {
    store: Store,
    guard: JobGuard,
    provider: SharedProvider,
    sandboxes: SharedSandboxProvider,
    hub: ProgressHub,
    signals: SignalBus,
    settings: WorkflowSettings,
}

impl WorkflowController {
    pub fn new(
        store: Store,
        provider: SharedProvider,
        sandboxes: SharedSandboxProvider,
        hub: ProgressHub,
        settings: WorkflowSettings,
    ) -> Self {
        let guard = JobGuard::new(store.clone(), settings.lease_ttl);
        Self {
            store,
            guard,
            provider,
            sandboxes,
            hub,
            signals: SignalBus::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    /// Signals that suspended steps of this controller's runs wait on.
    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Handle one trigger.
    ///
    /// Errors are returned only for problems outside a run (unknown job,
    /// datastore down before the guard decided); failures inside a run end
    /// in [`TerminalResult::Failed`].
    #[cfg_attr(
        feature = "telemetry",
        instrument(skip_all, fields(job_id = trigger.job_id()))
    )]
    pub async fn run(
        &self,
        trigger: Trigger,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<TerminalResult, WorkflowError> {
        let start = Instant::now();
        let result = match trigger {
            Trigger::Generate { job_id, prompt } => self.generate(&job_id, prompt, cancel).await,
            Trigger::ApplyFileOperations { job_id, operations } => {
                self.apply_file_operations(&job_id, &operations).await
            }
            Trigger::PushFiles { job_id, files } => self.push_files(&job_id, &files).await,
        };

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_operation("workflow.run", start.elapsed());
            match &result {
                Ok(outcome) => info!(?outcome, "Trigger finished"),
                Err(e) => warn!("Trigger failed: {}", e),
            }
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        result
    }

    async fn generate(
        &self,
        job_id: &str,
        prompt: String,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<TerminalResult, WorkflowError> {
        let candidate = uuid::Uuid::new_v4().to_string();
        let (lease, resumed) = match self.guard.authorize(job_id, &candidate)? {
            Authorization::Proceed { lease, resumed } => (lease, resumed),
            Authorization::SkipAlreadyRunning => {
                return Ok(TerminalResult::skipped(job_id, SkipReason::AlreadyRunning))
            }
            Authorization::SkipAlreadyDone => {
                return Ok(TerminalResult::skipped(job_id, SkipReason::AlreadyDone))
            }
        };

        let run_id = lease.run_id.clone();
        #[cfg(feature = "telemetry")]
        info!(job_id, %run_id, epoch = lease.epoch, resumed, "Job authorized");
        #[cfg(not(feature = "telemetry"))]
        let _ = resumed;

        let prompt = if prompt.trim().is_empty() {
            self.store.job_prompt(job_id)?
        } else {
            prompt
        };

        let reporter = ProgressReporter::new(self.hub.clone(), job_id);
        let mut ctx = StepContext::new(self.store.clone(), job_id, run_id.as_str(), self.settings.retry)
            .with_lease(self.guard.clone(), lease.clone())
            .with_signals(self.signals.clone());

        let result = match self.drive(&mut ctx, &reporter, job_id, &lease, &prompt, cancel).await {
            Ok(result) => Ok(result),
            Err(AgentError::Cancelled) => {
                #[cfg(feature = "telemetry")]
                {
                    info!(job_id, %run_id, "Job cancelled, leaving it pending");
                    GLOBAL_METRICS.increment("workflow.cancelled");
                }
                self.guard
                    .release(job_id, &lease)
                    .map(|_| TerminalResult::Cancelled {
                        job_id: job_id.to_string(),
                    })
                    .map_err(WorkflowError::from)
            }
            Err(e) => self.fail(&mut ctx, &reporter, job_id, &lease, e).await,
        };

        // A committed run is never replayed again.
        if matches!(result, Ok(TerminalResult::Completed { .. } | TerminalResult::Failed { .. })) {
            if let Err(e) = self.store.clear_checkpoints(job_id, &run_id) {
                #[cfg(feature = "telemetry")]
                warn!(job_id, %run_id, "Failed to clear checkpoints: {}", e);
                #[cfg(not(feature = "telemetry"))]
                let _ = e;
            }
        }

        self.signals.clear(job_id);
        self.hub.close(job_id);
        result
    }

    /// The generate pipeline. Any error returned here is fatal to the run.
    async fn drive(
        &self,
        ctx: &mut StepContext,
        reporter: &ProgressReporter,
        job_id: &str,
        lease: &Lease,
        prompt: &str,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<TerminalResult, AgentError> {
        let job = self.store.get_job(job_id)?;

        let tools = phase(reporter, PREPARING_SANDBOX, async {
            let sandbox_id: String = cancellable(
                &mut cancel,
                ctx.step("get-sandbox-id", || self.acquire_sandbox(job_id, lease)),
            )
            .await?;
            let sandbox = self.sandboxes.connect(&sandbox_id).await?;
            Ok::<_, AgentError>(Arc::new(SandboxTools::new(
                sandbox,
                reporter.clone(),
                self.settings.idle_timeout,
                self.settings.command_timeout,
            )))
        })
        .await?;

        let mut conversation = self.conversation(&job, prompt)?;
        let agent = Agent::new(self.provider.clone(), self.settings.coding.clone(), reporter.clone())
            .with_tools(tools.clone());
        let outcome = agent.run(&mut conversation, &mut *ctx, cancel.clone()).await?;

        let record = match outcome.summary {
            Some(summary) => {
                let title = self
                    .narrate(ctx, reporter, &mut cancel, "generate-title", &self.settings.title, &summary, DEFAULT_TITLE)
                    .await?;
                let message = self
                    .narrate(ctx, reporter, &mut cancel, "generate-response", &self.settings.response, &summary, &summary)
                    .await?;
                let url: String = ctx
                    .step("get-sandbox-url", || {
                        std::future::ready(Ok(sandbox_url(&tools.host(APP_PORT))))
                    })
                    .await?;

                SuccessRecord {
                    message,
                    fragment: Some(NewFragment {
                        sandbox_url: url,
                        title,
                        files: conversation.files.clone(),
                    }),
                }
            }
            None => SuccessRecord {
                message: outcome.final_text,
                fragment: None,
            },
        };

        let committed = phase(reporter, SAVING_RESULT, async {
            ctx.step("save-result", || save_result(&self.store, job_id, lease, &record))
                .await
        })
        .await?;

        Ok(match committed {
            CommitOutcome::Committed {
                message_id,
                fragment_id,
            } => {
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.increment("workflow.completed");
                TerminalResult::Completed {
                    job_id: job_id.to_string(),
                    message_id,
                    fragment_id,
                    sandbox_url: record.fragment.map(|f| f.sandbox_url),
                }
            }
            CommitOutcome::AlreadyTerminal => TerminalResult::skipped(job_id, SkipReason::AlreadyDone),
            CommitOutcome::NotOwner => TerminalResult::skipped(job_id, SkipReason::AlreadyRunning),
        })
    }

    /// Reuse the job's sandbox if one is bound, else create and bind one.
    /// A sandbox created here that loses the bind is torn down again.
    async fn acquire_sandbox(&self, job_id: &str, lease: &Lease) -> Result<String, AgentError> {
        if let Some(existing) = self.store.get_job(job_id)?.sandbox_ref {
            return Ok(existing);
        }

        let created = self
            .sandboxes
            .create(&self.settings.template, self.settings.idle_timeout)
            .await?;
        let bound = match self.guard.bind_sandbox(job_id, lease, &created) {
            Ok(bound) => bound,
            Err(e) => {
                self.discard_sandbox(job_id, &created).await;
                return Err(e.into());
            }
        };

        match bound {
            Some(winner) if winner == created => Ok(created),
            Some(winner) => {
                #[cfg(feature = "telemetry")]
                warn!(job_id, sandbox_id = %created, bound = %winner, "Job already has a sandbox, discarding the new one");
                self.discard_sandbox(job_id, &created).await;
                Ok(winner)
            }
            None => {
                self.discard_sandbox(job_id, &created).await;
                Err(AgentError::InvalidState(format!("no sandbox bound to job {}", job_id)))
            }
        }
    }

    async fn discard_sandbox(&self, job_id: &str, sandbox_id: &str) {
        match self.sandboxes.destroy(sandbox_id).await {
            Ok(()) => {
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.increment("workflow.sandbox_discarded");
            }
            Err(e) => {
                #[cfg(feature = "telemetry")]
                warn!(job_id, sandbox_id, "Failed to destroy unused sandbox: {}", e);
                #[cfg(not(feature = "telemetry"))]
                let _ = (job_id, e);
            }
        }
    }

    /// Conversation seeded with earlier messages of the same project.
    fn conversation(&self, job: &Job, prompt: &str) -> Result<Conversation, AgentError> {
        let mut messages = Vec::new();
        if self.settings.history_limit > 0 {
            for record in self
                .store
                .project_history(&job.project_id, &job.id, self.settings.history_limit)?
            {
                messages.push(match record.role {
                    MessageRole::User => Message::user(record.content),
                    MessageRole::Assistant => Message::assistant(record.content),
                });
            }
        }
        messages.push(Message::user(prompt));

        Ok(Conversation {
            messages,
            files: FileMap::new(),
        })
    }

    /// One narration completion as a step. A failed completion resolves to
    /// `fallback`, which is recorded like a real answer; only cancellation
    /// and lease loss propagate.
    #[allow(clippy::too_many_arguments)]
    async fn narrate(
        &self,
        ctx: &mut StepContext,
        reporter: &ProgressReporter,
        cancel: &mut Option<watch::Receiver<bool>>,
        step: &str,
        config: &AgentConfig,
        summary: &str,
        fallback: &str,
    ) -> Result<String, AgentError> {
        let agent = Agent::new(self.provider.clone(), config.clone(), reporter.clone());
        let recover = |e: AgentError| match e {
            AgentError::Cancelled => Err(e),
            e => {
                #[cfg(feature = "telemetry")]
                warn!(step, "Narration failed, using fallback: {}", e);
                #[cfg(not(feature = "telemetry"))]
                let _ = e;
                Ok(fallback.to_string())
            }
        };
        cancellable(cancel, ctx.step_or_else(step, || agent.narrate(summary), recover)).await
    }

    /// Persist the generic failure message for a run that hit a fatal error.
    async fn fail(
        &self,
        ctx: &mut StepContext,
        reporter: &ProgressReporter,
        job_id: &str,
        lease: &Lease,
        error: AgentError,
    ) -> Result<TerminalResult, WorkflowError> {
        #[cfg(feature = "telemetry")]
        {
            warn!(job_id, run_id = %lease.run_id, "Job failed: {}", error);
            GLOBAL_METRICS.increment("workflow.failed");
        }
        reporter.failed(EventKind::Step, GENERIC_FAILURE_MESSAGE, Some(&error.to_string()));

        let saved = ctx
            .step("save-error", || save_error(&self.store, job_id, lease))
            .await;
        match saved {
            Ok(CommitOutcome::Committed { .. }) => Ok(TerminalResult::Failed {
                job_id: job_id.to_string(),
                message: GENERIC_FAILURE_MESSAGE.to_string(),
            }),
            Ok(CommitOutcome::AlreadyTerminal) => Ok(TerminalResult::skipped(job_id, SkipReason::AlreadyDone)),
            // Lease lost: the run that owns the job now decides its outcome.
            Ok(CommitOutcome::NotOwner) | Err(AgentError::InvalidState(_)) => {
                Ok(TerminalResult::skipped(job_id, SkipReason::AlreadyRunning))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Wrap a pipeline phase in `started` and `completed`/`failed` step events.
async fn phase<T>(
    reporter: &ProgressReporter,
    title: &str,
    fut: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    reporter.started(EventKind::Step, title, None);
    let result = fut.await;
    match result {
        Ok(_) => reporter.completed(EventKind::Step, title, None),
        Err(AgentError::Cancelled) => {}
        Err(ref e) => reporter.failed(EventKind::Step, title, Some(&e.to_string())),
    }
    result
}

async fn save_result(store: &Store, job_id: &str, lease: &Lease, record: &SuccessRecord) -> Result<CommitOutcome, AgentError> {
    Ok(store.commit_success(job_id, lease, record)?)
}

async fn save_error(store: &Store, job_id: &str, lease: &Lease) -> Result<CommitOutcome, AgentError> {
    Ok(store.commit_failure(job_id, lease)?)
}
