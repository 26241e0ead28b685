// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local sandbox backend.
//!
//! Each sandbox is a scratch directory under a root:
//!
//! ```text
//! <root>/<sandbox-id>/.sandbox.json   metadata (template, idle timeout, last activity)
//! <root>/<sandbox-id>/workspace/      working directory for commands and files
//! ```
//!
//! Idle expiry is enforced lazily: `connect` removes and rejects a sandbox
//! whose last activity is older than its idle timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

#[cfg(feature = "telemetry")]
use tracing::{debug, warn};

use super::{normalize_path, CommandOutput, OutputChunk, Sandbox, SandboxProvider};
use crate::error::SandboxError;

const META_FILE: &str = ".sandbox.json";
const WORKSPACE_DIR: &str = "workspace";

/// Default root: `<cache dir>/sandforge/sandboxes`.
pub fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sandforge")
        .join("sandboxes")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxMeta {
    template: String,
    idle_timeout_ms: u64,
    last_active_ms: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl SandboxMeta {
    fn expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_active_ms) > self.idle_timeout_ms as i64
    }
}

/// Creates sandboxes as directories under `root`.
pub struct LocalSandboxProvider {
    root: PathBuf,
}

impl LocalSandboxProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of sandbox directories currently on disk.
    pub fn count(&self) -> usize {
        std::fs::read_dir(&self.root)
            .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self, template: &str, idle_timeout: Duration) -> Result<String, SandboxError> {
        let id = format!("local-{}", uuid::Uuid::new_v4().simple());
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(dir.join(WORKSPACE_DIR)).await?;

        let meta = SandboxMeta {
            template: template.to_string(),
            idle_timeout_ms: idle_timeout.as_millis() as u64,
            last_active_ms: chrono::Utc::now().timestamp_millis(),
            created_at: chrono::Utc::now(),
        };
        write_meta(&dir, &meta).await?;

        #[cfg(feature = "telemetry")]
        debug!(sandbox_id = %id, template, "Created local sandbox");

        Ok(id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if sandbox_id.contains(['/', '\\']) || sandbox_id.contains("..") {
            return Err(SandboxError::Unavailable(format!("invalid sandbox id: {}", sandbox_id)));
        }

        let dir = self.root.join(sandbox_id);
        let meta = match read_meta(&dir).await {
            Ok(meta) => meta,
            Err(_) => {
                return Err(SandboxError::Unavailable(format!("sandbox {} not found", sandbox_id)));
            }
        };

        if meta.expired(chrono::Utc::now().timestamp_millis()) {
            #[cfg(feature = "telemetry")]
            warn!(sandbox_id, "Local sandbox idle timeout elapsed; removing");
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(SandboxError::Unavailable(format!("sandbox {} expired", sandbox_id)));
        }

        Ok(Arc::new(LocalSandbox {
            id: sandbox_id.to_string(),
            dir,
        }))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        if sandbox_id.contains(['/', '\\']) || sandbox_id.contains("..") {
            return Err(SandboxError::Unavailable(format!("invalid sandbox id: {}", sandbox_id)));
        }
        match tokio::fs::remove_dir_all(self.root.join(sandbox_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A connected local sandbox.
pub struct LocalSandbox {
    id: String,
    dir: PathBuf,
}

impl LocalSandbox {
    pub fn workspace(&self) -> PathBuf {
        self.dir.join(WORKSPACE_DIR)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        Ok(self.workspace().join(normalize_path(path)?))
    }

    async fn ensure_alive(&self) -> Result<(), SandboxError> {
        if tokio::fs::metadata(self.dir.join(META_FILE)).await.is_err() {
            return Err(SandboxError::Unavailable(format!("sandbox {} was removed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        output: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<CommandOutput, SandboxError> {
        self.ensure_alive().await?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.workspace())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::CommandFailed(format!("failed to spawn shell: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async move {
            let (out, err, status) = tokio::join!(
                pump(stdout, output.clone(), OutputChunk::Stdout),
                pump(stderr, output, OutputChunk::Stderr),
                child.wait(),
            );
            (out, err, status)
        };

        // Dropping `run` on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, run).await {
            Ok((stdout, stderr, status)) => {
                let status = status?;
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            Err(_) => Err(SandboxError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_alive().await?;
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.ensure_alive().await?;
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        let mut meta = read_meta(&self.dir)
            .await
            .map_err(|_| SandboxError::Unavailable(format!("sandbox {} was removed", self.id)))?;
        meta.idle_timeout_ms = timeout.as_millis() as u64;
        meta.last_active_ms = chrono::Utc::now().timestamp_millis();
        write_meta(&self.dir, &meta).await
    }

    fn host(&self, port: u16) -> String {
        format!("localhost:{}", port)
    }
}

async fn pump<R>(
    reader: Option<R>,
    output: Option<mpsc::UnboundedSender<OutputChunk>>,
    wrap: fn(String) -> OutputChunk,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let Some(reader) = reader else {
        return collected;
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push_str(&line);
        collected.push('\n');
        if let Some(ref tx) = output {
            let _ = tx.send(wrap(format!("{}\n", line)));
        }
    }
    collected
}

async fn read_meta(dir: &Path) -> Result<SandboxMeta, SandboxError> {
    let raw = tokio::fs::read_to_string(dir.join(META_FILE)).await?;
    serde_json::from_str(&raw).map_err(|e| SandboxError::IoError(format!("corrupt sandbox metadata: {}", e)))
}

async fn write_meta(dir: &Path, meta: &SandboxMeta) -> Result<(), SandboxError> {
    let raw = serde_json::to_string_pretty(meta)
        .map_err(|e| SandboxError::IoError(format!("failed to encode sandbox metadata: {}", e)))?;
    tokio::fs::write(dir.join(META_FILE), raw).await?;
    Ok(())
}
