// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent types.

use serde::{Deserialize, Serialize};

use crate::config::ProfileConfig;
use crate::sandbox::FileMap;
use crate::types::{Message, ToolCall};

/// Built-in system prompt for the coding profile.
pub const CODING_PROMPT: &str = "You are a senior software engineer working in a sandboxed \
Next.js environment. Use the terminal tool to install packages and run commands, \
createOrUpdateFiles to write files, and readFiles to inspect existing files. \
Use relative paths. When the task is complete, reply with a short summary wrapped in \
<task_summary></task_summary> and nothing else.";

/// Built-in system prompt for the fragment title agent.
pub const TITLE_PROMPT: &str = "Generate a short, descriptive title (at most three words) \
for the work described in the summary. Reply with the title only.";

/// Built-in system prompt for the user-facing response agent.
pub const RESPONSE_PROMPT: &str = "Write a short, friendly message to the user explaining \
what was built, based on the summary. Do not use markdown headings or code.";

/// Runtime settings for one agent, derived from a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Advertise the sandbox tools to the model.
    pub use_tools: bool,
    /// Completions allowed per run.
    pub max_turns: usize,
}

impl AgentConfig {
    /// Build from a profile; `default_prompt` is used unless the profile overrides it.
    pub fn from_profile(profile: &ProfileConfig, default_prompt: &str) -> Self {
        Self {
            system_prompt: profile
                .system_prompt
                .clone()
                .unwrap_or_else(|| default_prompt.to_string()),
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
            use_tools: profile.tools,
            max_turns: profile.max_turns.max(1),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_profile(&ProfileConfig::coding(), CODING_PROMPT)
    }
}

/// Messages plus the files generated so far in this run.
///
/// Owned by one agent run and threaded through every turn by reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
    pub files: FileMap,
}

impl Conversation {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            files: FileMap::new(),
        }
    }

    pub fn with_files(mut self, files: FileMap) -> Self {
        self.files = files;
        self
    }

    /// Last assistant message text, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }
}

/// What a single completion asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStep {
    /// Plain text with no tool call and no summary marker.
    AssistantText { text: String },
    /// A tool call, with any text the model emitted alongside it.
    ToolCall {
        text: String,
        call: ToolCall,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_error: Option<String>,
    },
    /// The model declared the task done.
    Terminal { text: String, summary: String },
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnStats {
    pub turns: usize,
    pub tool_calls: usize,
    pub tool_errors: usize,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    /// Present when the model emitted a task summary.
    pub summary: Option<String>,
    /// Text of the final assistant message.
    pub final_text: String,
    pub stats: TurnStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_profile() {
        let config = AgentConfig::from_profile(&ProfileConfig::narration(), TITLE_PROMPT);
        assert!(!config.use_tools);
        assert_eq!(config.max_turns, 1);
        assert_eq!(config.system_prompt, TITLE_PROMPT);

        let mut profile = ProfileConfig::coding();
        profile.system_prompt = Some("custom".to_string());
        profile.max_turns = 0;
        let config = AgentConfig::from_profile(&profile, CODING_PROMPT);
        assert_eq!(config.system_prompt, "custom");
        assert_eq!(config.max_turns, 1);
    }

    #[test]
    fn test_step_wire_shape() {
        let step = AgentStep::Terminal {
            text: "<task_summary>done</task_summary>".to_string(),
            summary: "done".to_string(),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "terminal");
        let back: AgentStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_last_assistant_text() {
        let mut conv = Conversation::new("hi");
        assert!(conv.last_assistant_text().is_none());
        conv.messages.push(Message::assistant("first"));
        conv.messages.push(Message::assistant(""));
        assert_eq!(conv.last_assistant_text(), Some("first"));
    }
}
