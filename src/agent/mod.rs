// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool-calling agent loop.
//!
//! One [`Agent::advance`] is one completion: the stream is folded by a
//! [`TurnAccumulator`] into an [`AgentStep`]. [`Agent::run`] repeats that,
//! dispatching at most one tool call per turn against the sandbox and
//! appending its result to the [`Conversation`], until the model emits a
//! `<task_summary>` block, answers with plain text, or the turn budget runs
//! out.
//!
//! Every completion and every tool call goes through a [`StepRunner`], which
//! is how the workflow makes them durable.
//!
//! # Example
//!
//! ```rust,ignore
//! use sandforge::agent::{Agent, AgentConfig, Conversation, ImmediateRunner};
//!
//! let agent = Agent::new(provider, AgentConfig::default(), reporter).with_tools(tools);
//! let mut conversation = Conversation::new("build a todo list");
//! let outcome = agent.run(&mut conversation, &mut ImmediateRunner::new(), None).await?;
//! println!("{:?}", outcome.summary);
//! ```

mod runner;
mod stream;
mod types;

pub use runner::{ImmediateRunner, StepRunner};
pub use stream::{extract_summary, AccumulatedCall, TurnAccumulator, TurnOutput, TurnState};
pub use types::{
    AgentConfig, AgentOutcome, AgentStep, Conversation, TurnStats, CODING_PROMPT, RESPONSE_PROMPT,
    TITLE_PROMPT,
};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

#[cfg(feature = "telemetry")]
use tracing::{debug, instrument};

#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use crate::error::AgentError;
use crate::progress::{EventKind, EventPhase, ProgressEvent, ProgressReporter};
use crate::sandbox::{FileMap, SandboxTools};
use crate::tools::{self, ToolOutcome};
use crate::types::{CompletionRequest, Message, SharedProvider, ToolCall, ToolResult};

const THINKING: &str = "Thinking";

/// Drives a completion service through the tool-calling loop.
pub struct Agent {
    provider: SharedProvider,
    config: AgentConfig,
    reporter: ProgressReporter,
    tools: Option<Arc<SandboxTools>>,
}

impl Agent {
    pub fn new(provider: SharedProvider, config: AgentConfig, reporter: ProgressReporter) -> Self {
        Self {
            provider,
            config,
            reporter,
            tools: None,
        }
    }

    /// Attach the sandbox the tools run against.
    pub fn with_tools(mut self, tools: Arc<SandboxTools>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn request(&self, conversation: &Conversation) -> CompletionRequest {
        CompletionRequest {
            messages: conversation.messages.clone(),
            tools: if self.config.use_tools {
                tools::definitions()
            } else {
                Vec::new()
            },
            system_prompt: Some(self.config.system_prompt.clone()),
            temperature: Some(self.config.temperature),
            max_tokens: self.config.max_tokens,
        }
    }

    /// Request one completion and classify it.
    ///
    /// If the model emits several tool calls, only the first is kept.
    pub async fn advance(&self, conversation: &Conversation) -> Result<AgentStep, AgentError> {
        let request = self.request(conversation);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut accumulator = TurnAccumulator::new();
        let start = Instant::now();

        self.reporter.started(EventKind::Thinking, THINKING, None);

        let stream = self.provider.stream_chat(&request, tx);
        let consume = async {
            while let Some(event) = rx.recv().await {
                accumulator.push(event);
            }
        };
        let (result, ()) = tokio::join!(stream, consume);

        if let Err(e) = result {
            self.reporter
                .failed(EventKind::Thinking, THINKING, Some(&e.to_string()));
            return Err(e.into());
        }

        let output = accumulator.finish();

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_operation("agent.turn", start.elapsed());
            if output.tool_calls.len() > 1 {
                debug!(
                    count = output.tool_calls.len(),
                    "Model emitted several tool calls; dispatching the first"
                );
            }
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        self.reporter.emit(
            ProgressEvent::new(EventKind::Thinking, EventPhase::Completed, THINKING)
                .with_metadata("outputTokens", serde_json::json!(output.usage.output_tokens)),
        );

        let text = output.text;
        let step = match output.tool_calls.into_iter().next() {
            Some(first) => AgentStep::ToolCall {
                text,
                call: first.call,
                input_error: first.input_error,
            },
            None => match extract_summary(&text) {
                Some(summary) => AgentStep::Terminal { text, summary },
                None => AgentStep::AssistantText { text },
            },
        };
        Ok(step)
    }

    /// Run the loop to completion.
    ///
    /// Each completion counts as one turn. A run that has used `max_turns`
    /// completions without finishing fails with
    /// [`AgentError::TurnBudgetExhausted`]. Flipping `cancel` to `true`
    /// aborts the in-flight completion or tool call.
    #[cfg_attr(
        feature = "telemetry",
        instrument(skip_all, fields(job_id = self.reporter.job_id(), max_turns = self.config.max_turns))
    )]
    pub async fn run<R: StepRunner>(
        &self,
        conversation: &mut Conversation,
        runner: &mut R,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<AgentOutcome, AgentError> {
        let mut cancel = cancel;
        let mut stats = TurnStats::default();

        for turn in 1..=self.config.max_turns {
            stats.turns = turn;

            let step = {
                let snapshot: &Conversation = conversation;
                let name = format!("turn-{}", turn);
                // Boxed as `dyn Future + Send` so callers that spawn this future can
                // prove `Send` (works around rust-lang/rust#64552).
                let fut: StepFuture<'_, AgentStep> = Box::pin(runner.step(&name, || self.advance(snapshot)));
                cancellable(&mut cancel, fut).await?
            };

            match step {
                AgentStep::ToolCall {
                    text,
                    call,
                    input_error,
                } => {
                    stats.tool_calls += 1;
                    conversation
                        .messages
                        .push(Message::assistant_tool_call(text, call.clone()));

                    let outcome = match input_error {
                        Some(error) => ToolOutcome {
                            result: ToolResult::error(&call.id, format!("Error: {}", error)),
                            files: None,
                        },
                        None => {
                            let files = &conversation.files;
                            let name = format!("tool-{}", turn);
                            let fut: StepFuture<'_, ToolOutcome> = Box::pin(runner.step(&name, || self.call_tool(&call, files)));
                            cancellable(&mut cancel, fut).await?
                        }
                    };

                    #[cfg(feature = "telemetry")]
                    debug!(turn, tool = %call.name, is_error = outcome.result.is_error(), "Tool call finished");

                    if outcome.result.is_error() {
                        stats.tool_errors += 1;
                    }
                    if let Some(files) = outcome.files {
                        conversation.files = files;
                    }
                    conversation.messages.push(Message::tool(&outcome.result));
                }
                AgentStep::Terminal { text, summary } => {
                    conversation.messages.push(Message::assistant(text.clone()));
                    return Ok(AgentOutcome {
                        summary: Some(summary),
                        final_text: text,
                        stats,
                    });
                }
                AgentStep::AssistantText { text } => {
                    conversation.messages.push(Message::assistant(text.clone()));
                    return Ok(AgentOutcome {
                        summary: None,
                        final_text: text,
                        stats,
                    });
                }
            }
        }

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.increment("agent.turn_budget_exhausted");

        Err(AgentError::TurnBudgetExhausted(self.config.max_turns))
    }

    async fn call_tool(&self, call: &ToolCall, files: &FileMap) -> Result<ToolOutcome, AgentError> {
        match self.tools {
            Some(ref sandbox_tools) => Ok(tools::dispatch(sandbox_tools, call, files).await?),
            None => Ok(ToolOutcome {
                result: ToolResult::error(&call.id, "Error: no sandbox is attached to this agent"),
                files: None,
            }),
        }
    }

    /// Single completion over `input`, returning its text.
    ///
    /// Used by the narration profile; a summary marker, if any, is returned as is.
    pub async fn narrate(&self, input: &str) -> Result<String, AgentError> {
        let step = self.advance(&Conversation::new(input)).await?;
        let text = match step {
            AgentStep::AssistantText { text } => text,
            AgentStep::Terminal { summary, .. } => summary,
            AgentStep::ToolCall { text, .. } => text,
        };

        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::InvalidState("completion returned no text".to_string()));
        }
        Ok(text.to_string())
    }
}

/// Await `fut` unless `cancel` flips to `true` first.
type StepFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AgentError>> + Send + 'a>>;

pub(crate) async fn cancellable<T>(
    cancel: &mut Option<watch::Receiver<bool>>,
    fut: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    let Some(rx) = cancel.as_mut() else {
        return fut.await;
    };
    if *rx.borrow() {
        return Err(AgentError::Cancelled);
    }

    tokio::select! {
        result = fut => result,
        () = cancelled(rx) => Err(AgentError::Cancelled),
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can no longer happen.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfileConfig;
    use crate::progress::ProgressHub;
    use crate::providers::scripted::{ScriptedProvider, ScriptedTurn};
    use crate::sandbox::{LocalSandboxProvider, SandboxProvider};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn coding(max_turns: usize) -> AgentConfig {
        let mut profile = ProfileConfig::coding();
        profile.max_turns = max_turns;
        AgentConfig::from_profile(&profile, CODING_PROMPT)
    }

    async fn sandbox_tools(root: &std::path::Path, reporter: ProgressReporter) -> Arc<SandboxTools> {
        let provider = LocalSandboxProvider::new(root);
        let id = provider.create("nextjs", Duration::from_secs(600)).await.unwrap();
        Arc::new(SandboxTools::new(
            provider.connect(&id).await.unwrap(),
            reporter,
            Duration::from_secs(600),
            Duration::from_secs(10),
        ))
    }

    #[tokio::test]
    async fn test_advance_classifies_steps() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedTurn::text("just chatting"),
            ScriptedTurn::text("ok <task_summary>Built it</task_summary>"),
            ScriptedTurn::tool_call("c1", "terminal", json!({"command": "ls"})),
        ]));
        let agent = Agent::new(provider, coding(5), ProgressReporter::detached());
        let conv = Conversation::new("hi");

        assert!(matches!(agent.advance(&conv).await.unwrap(), AgentStep::AssistantText { .. }));
        assert!(matches!(
            agent.advance(&conv).await.unwrap(),
            AgentStep::Terminal { ref summary, .. } if summary == "Built it"
        ));
        assert!(matches!(
            agent.advance(&conv).await.unwrap(),
            AgentStep::ToolCall { ref call, .. } if call.name == "terminal"
        ));
    }

    #[tokio::test]
    async fn test_request_uses_profile() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::text("Todo App")]));
        let narration = AgentConfig::from_profile(&ProfileConfig::narration(), TITLE_PROMPT);
        let agent = Agent::new(provider.clone(), narration, ProgressReporter::detached());

        assert_eq!(agent.narrate("Built a todo app").await.unwrap(), "Todo App");

        let request = &provider.requests()[0];
        assert!(request.tools.is_empty());
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.system_prompt.as_deref(), Some(TITLE_PROMPT));
    }

    #[tokio::test]
    async fn test_run_writes_files_and_finishes() {
        let temp = tempdir().unwrap();
        let tools = sandbox_tools(temp.path(), ProgressReporter::detached()).await;
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedTurn::tool_call(
                "c1",
                "createOrUpdateFiles",
                json!({"files": [{"path": "app/page.tsx", "content": "export default 1"}]}),
            ),
            ScriptedTurn::text("<task_summary>Built a todo app</task_summary>"),
        ]));
        let agent = Agent::new(provider.clone(), coding(5), ProgressReporter::detached()).with_tools(tools);

        let mut conv = Conversation::new("build a todo list");
        let mut runner = ImmediateRunner::new();
        let outcome = agent.run(&mut conv, &mut runner, None).await.unwrap();

        assert_eq!(outcome.summary.as_deref(), Some("Built a todo app"));
        assert_eq!(outcome.stats.turns, 2);
        assert_eq!(outcome.stats.tool_calls, 1);
        assert_eq!(
            conv.files.get("app/page.tsx").map(String::as_str),
            Some("export default 1")
        );
        assert_eq!(runner.steps(), ["turn-1", "tool-1", "turn-2"]);

        // The tool result was sent back on the second completion.
        let second = &provider.requests()[1];
        assert!(second
            .messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("c1")));
    }

    #[tokio::test]
    async fn test_turn_budget_is_enforced() {
        let temp = tempdir().unwrap();
        let tools = sandbox_tools(temp.path(), ProgressReporter::detached()).await;
        let provider = Arc::new(
            ScriptedProvider::default().repeating(ScriptedTurn::tool_call(
                "c",
                "readFiles",
                json!({"files": ["missing.txt"]}),
            )),
        );
        let agent = Agent::new(provider.clone(), coding(3), ProgressReporter::detached()).with_tools(tools);

        let mut conv = Conversation::new("loop forever");
        let err = agent
            .run(&mut conv, &mut ImmediateRunner::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::TurnBudgetExhausted(3)));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_bad_tool_input_is_fed_back() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedTurn::Events(vec![
                crate::types::StreamEvent::ToolUseStart {
                    id: "c1".to_string(),
                    name: "terminal".to_string(),
                },
                crate::types::StreamEvent::ToolInputDelta("{not json".to_string()),
                crate::types::StreamEvent::ToolUseEnd,
                crate::types::StreamEvent::Done(crate::types::StopReason::ToolUse),
            ]),
            ScriptedTurn::text("<task_summary>gave up</task_summary>"),
        ]));
        let agent = Agent::new(provider, coding(5), ProgressReporter::detached());

        let mut conv = Conversation::new("x");
        let mut runner = ImmediateRunner::new();
        let outcome = agent.run(&mut conv, &mut runner, None).await.unwrap();

        assert_eq!(outcome.stats.tool_errors, 1);
        // No tool step runs for unparseable input.
        assert_eq!(runner.steps(), ["turn-1", "turn-2"]);
    }

    #[tokio::test]
    async fn test_provider_failure_is_error() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::fail("unreachable", true)]));
        let agent = Agent::new(provider, coding(5), ProgressReporter::detached());

        let err = agent
            .run(&mut Conversation::new("x"), &mut ImmediateRunner::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_hanging_completion() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::Hang]));
        let agent = Agent::new(provider, coding(5), ProgressReporter::detached());
        let (tx, rx) = watch::channel(false);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run(&mut Conversation::new("x"), &mut ImmediateRunner::new(), Some(rx)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        drop(canceller.await.unwrap());
    }

    #[tokio::test]
    async fn test_thinking_events_pair_up() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe("job");
        let provider = Arc::new(ScriptedProvider::new([ScriptedTurn::text("hello")]));
        let agent = Agent::new(provider, coding(1), ProgressReporter::new(hub.clone(), "job"));

        agent.advance(&Conversation::new("x")).await.unwrap();

        let started = sub.try_recv().unwrap();
        let completed = sub.try_recv().unwrap();
        assert_eq!(started.pairing_key(), completed.pairing_key());
        assert_eq!(completed.phase, EventPhase::Completed);
    }
}
