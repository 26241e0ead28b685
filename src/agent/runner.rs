// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Step execution seam between the agent loop and the workflow.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::AgentError;

/// Runs named side-effecting steps.
///
/// The agent loop wraps every completion and every tool call in a step. A
/// durable runner records each output and returns the recorded value when
/// the same step is reached again after a restart; `op` may be invoked more
/// than once when the runner retries.
pub trait StepRunner: Send {
    fn step<T, F, Fut>(&mut self, name: &str, op: F) -> impl Future<Output = Result<T, AgentError>> + Send
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, AgentError>> + Send;
}

/// Runs each step once, with no recording and no retry.
#[derive(Debug, Default)]
pub struct ImmediateRunner {
    steps: Vec<String>,
}

impl ImmediateRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the steps run so far.
    pub fn steps(&self) -> &[String] {
        &self.steps
    }
}

impl StepRunner for ImmediateRunner {
    async fn step<T, F, Fut>(&mut self, name: &str, op: F) -> Result<T, AgentError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, AgentError>> + Send,
    {
        self.steps.push(name.to_string());
        op().await
    }
}
