// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of workspace and resolved configuration,
//! supporting JSON and YAML formats.

use serde::{Deserialize, Serialize};

/// Default idle timeout for a sandbox before the host reclaims it.
pub const DEFAULT_SANDBOX_IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Default maximum number of completions per coding run.
pub const DEFAULT_MAX_TURNS: usize = 15;

/// Workspace configuration for sandforge.
/// Can be defined in .sandforge.json or .sandforge/config.json in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Completion provider to use (openai, ollama)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model name to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Custom base URL for the completion API
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Environment variable holding the completion API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Path of the SQLite datastore
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Coding agent profile overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coding: Option<ProfileConfigPartial>,

    /// Narration agent profile overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<ProfileConfigPartial>,

    /// Sandbox settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfigPartial>,

    /// Durable workflow settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowConfigPartial>,
}

/// Agent profile overrides (partial, for workspace config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether the profile exposes the sandbox tools to the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,

    /// Replaces the built-in system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Sandbox overrides (partial, for workspace config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfigPartial {
    /// `local` or `remote`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<u64>,

    /// Root directory for local sandboxes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_root: Option<String>,
}

/// Workflow overrides (partial, for workspace config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_ttl_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

/// Resolved agent profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub tools: bool,
    pub max_turns: usize,
    pub system_prompt: Option<String>,
}

impl ProfileConfig {
    /// Low randomness, full tool access.
    pub fn coding() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: None,
            tools: true,
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: None,
        }
    }

    /// Higher randomness, no tools, a single completion.
    pub fn narration() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: Some(512),
            tools: false,
            max_turns: 1,
            system_prompt: None,
        }
    }

    pub(crate) fn apply(&mut self, partial: &ProfileConfigPartial) {
        if let Some(temperature) = partial.temperature {
            self.temperature = temperature;
        }
        if partial.max_tokens.is_some() {
            self.max_tokens = partial.max_tokens;
        }
        if let Some(tools) = partial.tools {
            self.tools = tools;
        }
        if let Some(max_turns) = partial.max_turns {
            self.max_turns = max_turns;
        }
        if partial.system_prompt.is_some() {
            self.system_prompt = partial.system_prompt.clone();
        }
    }
}

/// Which sandbox implementation backs the tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Local,
    Remote,
}

impl std::str::FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown sandbox backend: {}", other)),
        }
    }
}

/// Resolved sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSandboxConfig {
    pub backend: SandboxBackend,
    pub base_url: Option<String>,
    pub api_key_env: String,
    pub template: String,
    pub idle_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub local_root: Option<String>,
}

impl Default for ResolvedSandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Local,
            base_url: None,
            api_key_env: "SANDBOX_API_KEY".to_string(),
            template: "nextjs".to_string(),
            idle_timeout_ms: DEFAULT_SANDBOX_IDLE_TIMEOUT_MS,
            command_timeout_ms: 120_000,
            local_root: None,
        }
    }
}

/// Resolved workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWorkflowConfig {
    /// Attempts per step, including the first
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// How long a claimed job stays owned without a step boundary
    pub lease_ttl_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ResolvedWorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            lease_ttl_ms: 10 * 60 * 1000,
            poll_interval_ms: 3000,
        }
    }
}

/// Resolved configuration with all values set.
/// This is the merged result of global, workspace, local, environment, and CLI configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub database: String,
    pub coding: ProfileConfig,
    pub narration: ProfileConfig,
    pub sandbox: ResolvedSandboxConfig,
    pub workflow: ResolvedWorkflowConfig,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            base_url: None,
            api_key_env: None,
            database: "sandforge.db".to_string(),
            coding: ProfileConfig::coding(),
            narration: ProfileConfig::narration(),
            sandbox: ResolvedSandboxConfig::default(),
            workflow: ResolvedWorkflowConfig::default(),
        }
    }
}
