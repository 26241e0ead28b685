// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-turn stream state machine.
//!
//! A [`TurnAccumulator`] consumes one [`StreamEvent`] per transition:
//!
//! ```text
//! Idle --TextDelta--> Text --ToolUseStart--> ToolInput --ToolUseEnd--> Text
//!   \______________________ Done(reason) ______________________________/--> Done
//! ```
//!
//! Text and tool-call fragments accumulate independently, so text emitted
//! between tool inputs is kept in order.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{StopReason, StreamEvent, TokenUsage, ToolCall};

static SUMMARY_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)<task_summary>(.*?)</task_summary>").ok());

/// Extract the first `<task_summary>` block, trimmed. Empty blocks do not count.
pub fn extract_summary(text: &str) -> Option<String> {
    let re = SUMMARY_RE.as_ref()?;
    let summary = re.captures(text)?.get(1)?.as_str().trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Text,
    ToolInput,
    Done,
}

#[derive(Debug)]
struct PendingTool {
    id: String,
    name: String,
    args: String,
}

/// A tool call whose arguments may have failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedCall {
    pub call: ToolCall,
    /// Set when the streamed arguments were not valid JSON.
    pub input_error: Option<String>,
}

/// Everything one completion produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    pub text: String,
    pub tool_calls: Vec<AccumulatedCall>,
    pub usage: TokenUsage,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug)]
pub struct TurnAccumulator {
    state: TurnState,
    text: String,
    pending: Option<PendingTool>,
    calls: Vec<AccumulatedCall>,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            text: String::new(),
            pending: None,
            calls: Vec::new(),
            usage: TokenUsage::default(),
            stop_reason: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Advance by one event. Events after `Done` are ignored.
    pub fn push(&mut self, event: StreamEvent) {
        if self.state == TurnState::Done {
            return;
        }

        match event {
            StreamEvent::TextDelta(delta) => {
                self.text.push_str(&delta);
                if self.state == TurnState::Idle {
                    self.state = TurnState::Text;
                }
            }
            StreamEvent::ToolUseStart { id, name } => {
                self.close_tool();
                self.pending = Some(PendingTool {
                    id,
                    name,
                    args: String::new(),
                });
                self.state = TurnState::ToolInput;
            }
            StreamEvent::ToolInputDelta(fragment) => {
                if let Some(ref mut pending) = self.pending {
                    pending.args.push_str(&fragment);
                }
            }
            StreamEvent::ToolUseEnd => {
                self.close_tool();
                self.state = TurnState::Text;
            }
            StreamEvent::Usage(usage) => {
                self.usage.input_tokens += usage.input_tokens;
                self.usage.output_tokens += usage.output_tokens;
            }
            StreamEvent::Done(reason) => {
                self.close_tool();
                self.stop_reason = Some(reason);
                self.state = TurnState::Done;
            }
        }
    }

    fn close_tool(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let raw = pending.args.trim();
        let (input, input_error) = if raw.is_empty() {
            (serde_json::json!({}), None)
        } else {
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(value) => (value, None),
                Err(e) => (
                    serde_json::Value::Null,
                    Some(format!("Invalid JSON arguments for {}: {}", pending.name, e)),
                ),
            }
        };

        self.calls.push(AccumulatedCall {
            call: ToolCall {
                id: pending.id,
                name: pending.name,
                input,
            },
            input_error,
        });
    }

    /// Close any open tool call and return the turn's output.
    pub fn finish(mut self) -> TurnOutput {
        self.close_tool();
        TurnOutput {
            text: self.text,
            tool_calls: self.calls,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}
