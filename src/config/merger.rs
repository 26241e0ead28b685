// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::collections::HashMap;

use super::types::{ResolvedConfig, SandboxBackend, WorkspaceConfig};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "SANDFORGE_";

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub database: Option<String>,
    pub sandbox_backend: Option<SandboxBackend>,
    pub max_turns: Option<usize>,
}

/// `SANDFORGE_*` environment overrides.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    vars: HashMap<String, String>,
}

impl EnvOverrides {
    /// Capture the overrides present in the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build overrides from arbitrary key/value pairs; keys without the prefix are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter_map(|(k, v)| k.strip_prefix(ENV_PREFIX).map(|rest| (rest.to_string(), v)))
            .collect();
        Self { vars }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid {}{}={}", ENV_PREFIX, key, raw);
                None
            }
        }
    }
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Environment (`SANDFORGE_*`)
/// 3. Local config (.sandforge.local.json)
/// 4. Workspace config (.sandforge.json)
/// 5. Global config (~/.sandforge/config.json)
/// 6. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    env: &EnvOverrides,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_env_overrides(&mut result, env);
    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref provider) = config.provider {
        result.provider = provider.clone();
    }

    if config.model.is_some() {
        result.model = config.model.clone();
    }

    if config.base_url.is_some() {
        result.base_url = config.base_url.clone();
    }

    if config.api_key_env.is_some() {
        result.api_key_env = config.api_key_env.clone();
    }

    if let Some(ref database) = config.database {
        result.database = database.clone();
    }

    if let Some(ref coding) = config.coding {
        result.coding.apply(coding);
    }

    if let Some(ref narration) = config.narration {
        result.narration.apply(narration);
    }

    if let Some(ref sandbox) = config.sandbox {
        if let Some(ref backend) = sandbox.backend {
            match backend.parse() {
                Ok(backend) => result.sandbox.backend = backend,
                Err(e) => tracing::warn!("{}", e),
            }
        }
        if sandbox.base_url.is_some() {
            result.sandbox.base_url = sandbox.base_url.clone();
        }
        if let Some(ref key_env) = sandbox.api_key_env {
            result.sandbox.api_key_env = key_env.clone();
        }
        if let Some(ref template) = sandbox.template {
            result.sandbox.template = template.clone();
        }
        if let Some(ms) = sandbox.idle_timeout_ms {
            result.sandbox.idle_timeout_ms = ms;
        }
        if let Some(ms) = sandbox.command_timeout_ms {
            result.sandbox.command_timeout_ms = ms;
        }
        if sandbox.local_root.is_some() {
            result.sandbox.local_root = sandbox.local_root.clone();
        }
    }

    if let Some(ref workflow) = config.workflow {
        if let Some(attempts) = workflow.max_attempts {
            result.workflow.max_attempts = attempts.max(1);
        }
        if let Some(ms) = workflow.backoff_base_ms {
            result.workflow.backoff_base_ms = ms;
        }
        if let Some(ms) = workflow.lease_ttl_ms {
            result.workflow.lease_ttl_ms = ms;
        }
        if let Some(ms) = workflow.poll_interval_ms {
            result.workflow.poll_interval_ms = ms;
        }
    }
}

fn apply_env_overrides(result: &mut ResolvedConfig, env: &EnvOverrides) {
    if let Some(provider) = env.get("PROVIDER") {
        result.provider = provider.to_string();
    }
    if let Some(model) = env.get("MODEL") {
        result.model = Some(model.to_string());
    }
    if let Some(url) = env.get("BASE_URL") {
        result.base_url = Some(url.to_string());
    }
    if let Some(database) = env.get("DATABASE") {
        result.database = database.to_string();
    }
    if let Some(backend) = env.parse("SANDBOX_BACKEND") {
        result.sandbox.backend = backend;
    }
    if let Some(url) = env.get("SANDBOX_URL") {
        result.sandbox.base_url = Some(url.to_string());
    }
    if let Some(ms) = env.parse("SANDBOX_IDLE_TIMEOUT_MS") {
        result.sandbox.idle_timeout_ms = ms;
    }
    if let Some(turns) = env.parse("MAX_TURNS") {
        result.coding.max_turns = turns;
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref provider) = cli.provider {
        result.provider = provider.clone();
    }

    if cli.model.is_some() {
        result.model = cli.model.clone();
    }

    if cli.base_url.is_some() {
        result.base_url = cli.base_url.clone();
    }

    if let Some(ref database) = cli.database {
        result.database = database.clone();
    }

    if let Some(backend) = cli.sandbox_backend {
        result.sandbox.backend = backend;
    }

    if let Some(turns) = cli.max_turns {
        result.coding.max_turns = turns;
    }
}
