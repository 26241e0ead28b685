// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Deterministic completion service.
//!
//! Replays one [`ScriptedTurn`] per `stream_chat` call. Used by the test
//! suite and by `sandforge run --dry-run`.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::types::{CompletionRequest, Provider, StopReason, StreamEvent, TokenUsage};

/// One canned completion.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream these events, then return `Ok`.
    Events(Vec<StreamEvent>),
    /// Fail the call. `retryable` picks a network error over an auth error.
    Fail { message: String, retryable: bool },
    /// Never finish; used to exercise cancellation.
    Hang,
}

impl ScriptedTurn {
    /// A plain text answer, streamed in two deltas.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mid = text
            .char_indices()
            .map(|(i, _)| i)
            .nth(text.chars().count() / 2)
            .unwrap_or(0);
        let (head, tail) = text.split_at(mid);

        let mut events = Vec::new();
        for part in [head, tail] {
            if !part.is_empty() {
                events.push(StreamEvent::TextDelta(part.to_string()));
            }
        }
        events.push(StreamEvent::Usage(TokenUsage {
            input_tokens: 10,
            output_tokens: text.len() as u32,
        }));
        events.push(StreamEvent::Done(StopReason::EndTurn));
        Self::Events(events)
    }

    /// A tool call whose JSON arguments arrive in two fragments.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        let args = input.to_string();
        let mid = args.len() / 2;
        let (head, tail) = args.split_at(if args.is_char_boundary(mid) { mid } else { 0 });

        Self::Events(vec![
            StreamEvent::ToolUseStart {
                id: id.into(),
                name: name.into(),
            },
            StreamEvent::ToolInputDelta(head.to_string()),
            StreamEvent::ToolInputDelta(tail.to_string()),
            StreamEvent::ToolUseEnd,
            StreamEvent::Done(StopReason::ToolUse),
        ])
    }

    pub fn fail(message: impl Into<String>, retryable: bool) -> Self {
        Self::Fail {
            message: message.into(),
            retryable,
        }
    }
}

/// Completion service that replays a fixed script.
///
/// When the script runs out, the `repeat` turn (if any) is served forever;
/// otherwise calls fail with a non-retryable error.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    repeat: Option<ScriptedTurn>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Serve `turn` whenever the script is exhausted.
    pub fn repeating(mut self, turn: ScriptedTurn) -> Self {
        self.repeat = Some(turn);
        self
    }

    /// Append turns to the end of the script.
    pub fn push(&self, turn: ScriptedTurn) {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(turn);
    }

    /// Number of completions requested so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let next = self
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.or_else(|| self.repeat.clone())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream_chat(
        &self,
        request: &CompletionRequest,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        match self.next_turn() {
            Some(ScriptedTurn::Events(script)) => {
                for event in script {
                    let _ = events.send(event);
                    tokio::task::yield_now().await;
                }
                Ok(())
            }
            Some(ScriptedTurn::Fail { message, retryable }) => Err(if retryable {
                ProviderError::NetworkError(message)
            } else {
                ProviderError::AuthError(message)
            }),
            Some(ScriptedTurn::Hang) => loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
            None => Err(ProviderError::api_message("script exhausted")),
        }
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(provider: &ScriptedProvider) -> Result<Vec<StreamEvent>, ProviderError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.stream_chat(&CompletionRequest::default(), tx).await?;
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_replays_turns_in_order() {
        let provider = ScriptedProvider::new([
            ScriptedTurn::text("hello world"),
            ScriptedTurn::tool_call("c1", "terminal", serde_json::json!({"command": "ls"})),
        ]);

        let first = collect(&provider).await.unwrap();
        let text: String = first
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello world");

        let second = collect(&provider).await.unwrap();
        let args: String = second
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolInputDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(args, r#"{"command":"ls"}"#);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_script_fails_unless_repeating() {
        let provider = ScriptedProvider::default();
        assert!(collect(&provider).await.is_err());

        let provider = ScriptedProvider::default().repeating(ScriptedTurn::text("again"));
        assert!(collect(&provider).await.is_ok());
        assert!(collect(&provider).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_turn_maps_retryability() {
        let provider = ScriptedProvider::new([
            ScriptedTurn::fail("reset", true),
            ScriptedTurn::fail("denied", false),
        ]);
        assert!(collect(&provider).await.unwrap_err().is_retryable());
        assert!(!collect(&provider).await.unwrap_err().is_retryable());
    }
}
