// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for sandforge.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.sandforge/config.json
//! - Workspace config: .sandforge.json, .sandforge/config.json, or sandforge.config.json
//! - Local config: .sandforge.local.json (gitignored, for personal overrides)
//! - Environment: `SANDFORGE_*` variables
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > env > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_example_config, get_global_config_dir, get_global_config_path,
    init_config, load_config_file, load_global_config, load_local_config, load_workspace_config,
    save_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions, EnvOverrides, ENV_PREFIX};

pub use types::{
    ProfileConfig, ProfileConfigPartial, ResolvedConfig, ResolvedSandboxConfig,
    ResolvedWorkflowConfig, SandboxBackend, SandboxConfigPartial, WorkflowConfigPartial,
    WorkspaceConfig, DEFAULT_MAX_TURNS, DEFAULT_SANDBOX_IDLE_TIMEOUT_MS,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
///
/// This is the main entry point for configuration loading.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    Ok(merge_config(
        global,
        workspace,
        local,
        &EnvOverrides::from_env(),
        cli_options,
    ))
}
