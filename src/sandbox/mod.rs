// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandboxed execution environments.
//!
//! A [`SandboxProvider`] creates sandboxes and reconnects to them by id; a
//! [`Sandbox`] runs shell commands and reads/writes files inside one.
//! [`SandboxTools`] wraps a connected sandbox with the three primitives the
//! agent sees, plus idle-timeout renewal and progress reporting.
//!
//! Backends:
//! - [`local::LocalSandboxProvider`] - scratch directories on this machine
//! - [`remote::RemoteSandboxProvider`] - an HTTP sandbox host

pub mod adapter;
pub mod local;
pub mod remote;

pub use adapter::{classify_command, CommandClass, SandboxTools};
pub use local::LocalSandboxProvider;
pub use remote::RemoteSandboxProvider;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{ResolvedSandboxConfig, SandboxBackend};
use crate::error::SandboxError;

/// Port the generated app listens on inside the sandbox.
pub const APP_PORT: u16 = 3000;

/// Accumulated file contents keyed by path.
pub type FileMap = BTreeMap<String, String>;

/// One file to write, as the model sends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Collected output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Incremental command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// A connected sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Run `command` through a shell. Output chunks are forwarded to `output`
    /// as they arrive; the returned value holds the complete output.
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        output: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<CommandOutput, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Reset the idle timeout; the host reclaims the sandbox once it expires.
    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError>;

    /// Public address of `port` inside the sandbox.
    fn host(&self, port: u16) -> String;
}

/// Creates and reconnects sandboxes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a sandbox from `template` and return its id.
    async fn create(&self, template: &str, idle_timeout: Duration) -> Result<String, SandboxError>;

    /// Reconnect to an existing sandbox. Fails with
    /// [`SandboxError::Unavailable`] when it no longer exists.
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;

    /// Tear a sandbox down before its idle timeout. A sandbox that is
    /// already gone counts as destroyed.
    async fn destroy(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}

/// Shared provider handle.
pub type SharedSandboxProvider = Arc<dyn SandboxProvider>;

/// Build the backend selected by configuration.
pub fn create_sandbox_provider(config: &ResolvedSandboxConfig) -> Result<SharedSandboxProvider, SandboxError> {
    match config.backend {
        SandboxBackend::Local => {
            let root = match config.local_root {
                Some(ref root) => PathBuf::from(root),
                None => local::default_root(),
            };
            Ok(Arc::new(LocalSandboxProvider::new(root)))
        }
        SandboxBackend::Remote => {
            let base_url = config.base_url.clone().ok_or_else(|| {
                SandboxError::Unavailable("sandbox.baseUrl is required for the remote backend".to_string())
            })?;
            let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
            Ok(Arc::new(RemoteSandboxProvider::new(base_url, api_key)))
        }
    }
}

/// Public URL for a sandbox host. Loopback hosts are served over plain HTTP.
pub fn sandbox_url(host: &str) -> String {
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        format!("http://{}", host)
    } else {
        format!("https://{}", host)
    }
}

/// Normalize a sandbox path to a relative path without `..` components.
///
/// Leading `/` is stripped so `/app/page.tsx` and `app/page.tsx` name the
/// same file.
pub fn normalize_path(path: &str) -> Result<String, SandboxError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::InvalidPath("empty path".to_string()));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidPath(path.to_string()));
            }
        }
    }

    if parts.is_empty() {
        return Err(SandboxError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("app/page.tsx").unwrap(), "app/page.tsx");
        assert_eq!(normalize_path("/app/./page.tsx").unwrap(), "app/page.tsx");
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("app/../../x").is_err());
        assert!(normalize_path("  ").is_err());
        assert!(normalize_path("/").is_err());
    }

    #[test]
    fn test_sandbox_url_scheme() {
        assert_eq!(sandbox_url("localhost:3000"), "http://localhost:3000");
        assert_eq!(sandbox_url("3000-abc.sandbox.dev"), "https://3000-abc.sandbox.dev");
    }

    #[test]
    fn test_remote_backend_requires_url() {
        let config = ResolvedSandboxConfig {
            backend: SandboxBackend::Remote,
            ..Default::default()
        };
        assert!(matches!(
            create_sandbox_provider(&config),
            Err(SandboxError::Unavailable(_))
        ));
    }
}
