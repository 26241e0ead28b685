// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable, checkpointed step execution.
//!
//! Every step gets a key `"{seq:03}:{name}"` from a per-run counter, so a
//! replay that walks the same code path reaches the same keys in the same
//! order. A step whose output is recorded returns it without running again;
//! a step that failed or never finished runs again.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
#[cfg(feature = "telemetry")]
use tracing::{debug, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use super::signal::SignalBus;
use crate::agent::StepRunner;
use crate::config::ResolvedWorkflowConfig;
use crate::error::AgentError;
use crate::guard::JobGuard;
use crate::store::{now_millis, Lease, Store};

/// Upper bound for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How failing steps are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResolvedWorkflowConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResolvedWorkflowConfig::default())
    }
}

/// Step runner for one `(job, run)` pair.
pub struct StepContext {
    store: Store,
    job_id: String,
    run_id: String,
    lease: Option<(JobGuard, Lease)>,
    signals: SignalBus,
    policy: RetryPolicy,
    seq: usize,
    replayed: usize,
    executed: usize,
}

impl StepContext {
    pub fn new(store: Store, job_id: impl Into<String>, run_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            run_id: run_id.into(),
            lease: None,
            signals: SignalBus::new(),
            policy,
            seq: 0,
            replayed: 0,
            executed: 0,
        }
    }

    /// Renew `lease` through `guard` at every step boundary.
    pub fn with_lease(mut self, guard: JobGuard, lease: Lease) -> Self {
        self.lease = Some((guard, lease));
        self
    }

    pub fn with_signals(mut self, signals: SignalBus) -> Self {
        self.signals = signals;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Steps answered from a checkpoint.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Steps that actually ran.
    pub fn executed(&self) -> usize {
        self.executed
    }

    fn next_key(&mut self, name: &str) -> String {
        let key = format!("{:03}:{}", self.seq, name);
        self.seq += 1;
        key
    }

    fn renew_lease(&self) -> Result<(), AgentError> {
        if let Some((ref guard, ref lease)) = self.lease {
            if !guard.renew(&self.job_id, lease)? {
                return Err(AgentError::InvalidState(format!(
                    "run {} no longer owns job {}",
                    self.run_id, self.job_id
                )));
            }
        }
        Ok(())
    }

    fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, AgentError> {
        serde_json::from_value(value).map_err(|e| AgentError::Checkpoint(format!("{}: {}", key, e)))
    }

    /// Sleep until a wake time recorded on first execution. A replay only
    /// sleeps for whatever is left.
    pub async fn sleep(&mut self, name: &str, duration: Duration) -> Result<(), AgentError> {
        let key = self.next_key(name);
        self.renew_lease()?;

        let wake_at = now_millis() + duration.as_millis() as i64;
        let stored = self
            .store
            .put_checkpoint(&self.job_id, &self.run_id, &key, &json!({ "wakeAt": wake_at }))?;
        let wake_at = stored["wakeAt"].as_i64().unwrap_or(wake_at);

        let remaining = wake_at - now_millis();
        if remaining > 0 {
            tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
        }
        self.renew_lease()
    }

    /// Suspend until `name` is signalled on the bus or `timeout` passes.
    /// Returns whether the signal arrived; the outcome is recorded.
    pub async fn wait_for_signal(&mut self, name: &str, timeout: Duration) -> Result<bool, AgentError> {
        let key = self.next_key(name);
        self.renew_lease()?;

        if let Some(value) = self.store.get_checkpoint(&self.job_id, &self.run_id, &key)? {
            self.replayed += 1;
            return Self::decode(&key, value);
        }

        let deadline_key = format!("{}#deadline", key);
        let deadline = now_millis() + timeout.as_millis() as i64;
        let stored = self
            .store
            .put_checkpoint(&self.job_id, &self.run_id, &deadline_key, &json!(deadline))?;
        let remaining = (stored.as_i64().unwrap_or(deadline) - now_millis()).max(0) as u64;

        let signalled = tokio::time::timeout(
            Duration::from_millis(remaining),
            self.signals.wait(&self.job_id, name),
        )
        .await
        .is_ok();

        #[cfg(feature = "telemetry")]
        debug!(job_id = %self.job_id, signal = name, signalled, "Wait finished");

        let stored = self
            .store
            .put_checkpoint(&self.job_id, &self.run_id, &key, &json!(signalled))?;
        self.executed += 1;
        self.renew_lease()?;
        Self::decode(&key, stored)
    }
}

/// Metric name for a step: `turn-3` and `turn-4` both count as `turn`.
#[cfg(feature = "telemetry")]
fn metric_name(name: &str) -> String {
    let base = name
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .trim_end_matches('-');
    format!("workflow.step.{}", base)
}

impl StepContext {
    /// Like [`StepRunner::step`], except that an error left after the
    /// retries goes to `recover`. A value it returns is recorded as the
    /// step's output, so a replay does not run the op again.
    pub async fn step_or_else<T, F, Fut, R>(&mut self, name: &str, op: F, recover: R) -> Result<T, AgentError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, AgentError>> + Send,
        R: FnOnce(AgentError) -> Result<T, AgentError> + Send,
    {
        let key = self.next_key(name);
        self.renew_lease()?;

        if let Some(value) = self.store.get_checkpoint(&self.job_id, &self.run_id, &key)? {
            #[cfg(feature = "telemetry")]
            debug!(job_id = %self.job_id, step = %key, "Replaying recorded step");
            self.replayed += 1;
            return Self::decode(&key, value);
        }

        let start = Instant::now();
        let mut attempt = 1;
        let output = loop {
            match op().await {
                Ok(output) => break output,
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    #[cfg(feature = "telemetry")]
                    warn!(job_id = %self.job_id, step = %key, attempt, ?delay, "Step failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    self.renew_lease()?;
                }
                Err(e) => {
                    #[cfg(feature = "telemetry")]
                    {
                        warn!(job_id = %self.job_id, step = %key, attempt, "Step failed: {}", e);
                        GLOBAL_METRICS.increment("workflow.step_failed");
                    }
                    break recover(e)?;
                }
            }
        };

        let value = serde_json::to_value(&output)
            .map_err(|e| AgentError::Checkpoint(format!("{}: {}", key, e)))?;
        let stored = self.store.put_checkpoint(&self.job_id, &self.run_id, &key, &value)?;
        self.executed += 1;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation(&metric_name(name), start.elapsed());
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        Self::decode(&key, stored)
    }
}

impl StepRunner for StepContext {
    async fn step<T, F, Fut>(&mut self, name: &str, op: F) -> Result<T, AgentError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, AgentError>> + Send,
    {
        self.step_or_else(name, op, Err).await
    }
}
