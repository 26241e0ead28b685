// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool-facing view of a connected sandbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

#[cfg(feature = "telemetry")]
use tracing::{debug, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use super::{normalize_path, CommandOutput, FileEntry, FileMap, OutputChunk, Sandbox};
use crate::error::SandboxError;
use crate::progress::{EventKind, EventPhase, ProgressEvent, ProgressReporter};

const DESCRIPTION_LIMIT: usize = 200;

static INSTALL_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\b(npm|pnpm|yarn|bun)\s+(install|i|add|ci)\b|\bpip3?\s+install\b|\bcargo\s+add\b")
        .ok()
});

static BUILD_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?build\b|\bnext\s+build\b|\bcargo\s+build\b|\bmake\b")
        .ok()
});

static DEV_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\b(npm|pnpm|yarn|bun)\s+(run\s+)?(dev|start)\b|\bnext\s+(dev|start)\b")
        .ok()
});

/// Coarse category of a shell command, used to pick its progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Install,
    Build,
    DevServer,
    Other,
}

impl CommandClass {
    /// Long-running commands get a `started` event before their outcome.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Other)
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Install => "Installing dependencies",
            Self::Build => "Building project",
            Self::DevServer => "Starting dev server",
            Self::Other => "Running command",
        }
    }
}

fn is_match(re: &Option<Regex>, command: &str) -> bool {
    re.as_ref().map(|re| re.is_match(command)).unwrap_or(false)
}

pub fn classify_command(command: &str) -> CommandClass {
    if is_match(&INSTALL_RE, command) {
        CommandClass::Install
    } else if is_match(&BUILD_RE, command) {
        CommandClass::Build
    } else if is_match(&DEV_RE, command) {
        CommandClass::DevServer
    } else {
        CommandClass::Other
    }
}

/// The three sandbox primitives exposed to the agent.
///
/// Every call first renews the sandbox idle timeout, then reports its
/// progress on the job's topic.
pub struct SandboxTools {
    sandbox: Arc<dyn Sandbox>,
    reporter: ProgressReporter,
    idle_timeout: Duration,
    command_timeout: Duration,
}

impl SandboxTools {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        reporter: ProgressReporter,
        idle_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            sandbox,
            reporter,
            idle_timeout,
            command_timeout,
        }
    }

    pub fn sandbox_id(&self) -> &str {
        self.sandbox.id()
    }

    pub fn host(&self, port: u16) -> String {
        self.sandbox.host(port)
    }

    /// Reset the idle timeout. Only a vanished sandbox is an error here.
    pub async fn renew(&self) -> Result<(), SandboxError> {
        match self.sandbox.set_timeout(self.idle_timeout).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                #[cfg(feature = "telemetry")]
                warn!(sandbox_id = self.sandbox.id(), error = %e, "Failed to renew sandbox timeout");
                let _ = e;
                Ok(())
            }
        }
    }

    /// Run a shell command. A non-zero exit is returned as output, not as an error.
    pub async fn execute(&self, command: &str) -> Result<CommandOutput, SandboxError> {
        self.renew().await?;

        let class = classify_command(command);
        let title = class.title();
        let description = preview(command);
        let start = Instant::now();

        let result = if class.is_user_visible() {
            self.reporter.started(EventKind::Action, title, Some(&description));

            let (tx, mut rx) = mpsc::unbounded_channel();
            let exec = self.sandbox.execute(command, self.command_timeout, Some(tx));
            let forward = async {
                while let Some(chunk) = rx.recv().await {
                    let (stream, text) = match chunk {
                        OutputChunk::Stdout(text) => ("stdout", text),
                        OutputChunk::Stderr(text) => ("stderr", text),
                    };
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    self.reporter.emit(
                        ProgressEvent::new(EventKind::Action, EventPhase::InProgress, title)
                            .with_description(preview(text))
                            .with_metadata("stream", serde_json::json!(stream)),
                    );
                }
            };
            let (result, ()) = tokio::join!(exec, forward);
            result
        } else {
            self.sandbox.execute(command, self.command_timeout, None).await
        };

        let success = matches!(result, Ok(ref out) if out.success());

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_tool("terminal", start.elapsed(), success);
            debug!(
                sandbox_id = self.sandbox.id(),
                class = ?class,
                success,
                duration_ms = start.elapsed().as_millis() as u64,
                "Sandbox command finished"
            );
        }
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        match result {
            Ok(out) if success => {
                self.reporter.emit(
                    ProgressEvent::new(EventKind::Action, EventPhase::Completed, title)
                        .with_description(description)
                        .with_metadata("exitCode", serde_json::json!(out.exit_code)),
                );
                Ok(out)
            }
            Ok(out) => {
                self.reporter.emit(
                    ProgressEvent::new(EventKind::Action, EventPhase::Failed, title)
                        .with_description(format!("exit code {}", out.exit_code))
                        .with_metadata("exitCode", serde_json::json!(out.exit_code)),
                );
                Ok(out)
            }
            Err(e) => {
                self.reporter
                    .failed(EventKind::Action, title, Some(&e.to_string()));
                Err(e)
            }
        }
    }

    /// Write `entries` and return `current` updated with them.
    ///
    /// Paths are normalized. Every entry reaches the sandbox, since commands
    /// may have changed its filesystem since `current` was recorded. A path
    /// listed more than once in the same call is written once, with its last
    /// content.
    pub async fn write_files(&self, entries: &[FileEntry], current: &FileMap) -> Result<FileMap, SandboxError> {
        self.renew().await?;

        let visible = entries.len() > 1;
        let title = if visible { "Writing files" } else { "Writing file" };
        let description = entries
            .iter()
            .map(|e| e.path.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let start = Instant::now();

        if visible {
            self.reporter
                .started(EventKind::Action, title, Some(&preview(&description)));
        }

        let mut updated = current.clone();
        let result = match collapse_entries(entries) {
            Ok(batch) => {
                let mut written = 0usize;
                let mut outcome = Ok(());
                for (path, content) in batch {
                    if let Err(e) = self.sandbox.write_file(&path, content).await {
                        outcome = Err(e);
                        break;
                    }
                    updated.insert(path, content.to_string());
                    written += 1;
                }
                outcome.map(|()| written)
            }
            Err(e) => Err(e),
        };

        let written = match result {
            Ok(written) => written,
            Err(e) => {
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.record_tool("createOrUpdateFiles", start.elapsed(), false);
                self.reporter
                    .failed(EventKind::Action, title, Some(&e.to_string()));
                return Err(e);
            }
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_tool("createOrUpdateFiles", start.elapsed(), true);
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        self.reporter.emit(
            ProgressEvent::new(EventKind::Action, EventPhase::Completed, title)
                .with_description(preview(&description))
                .with_metadata("files", serde_json::json!(written)),
        );
        Ok(updated)
    }

    /// Read `paths`; fails on the first file that cannot be read.
    pub async fn read_files(&self, paths: &[String]) -> Result<Vec<FileEntry>, SandboxError> {
        self.renew().await?;

        let title = "Reading files";
        let description = preview(&paths.join(", "));
        let start = Instant::now();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            match self.sandbox.read_file(path).await {
                Ok(content) => out.push(FileEntry::new(path.clone(), content)),
                Err(e) => {
                    #[cfg(feature = "telemetry")]
                    GLOBAL_METRICS.record_tool("readFiles", start.elapsed(), false);
                    self.reporter
                        .failed(EventKind::Action, title, Some(&e.to_string()));
                    return Err(e);
                }
            }
        }

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_tool("readFiles", start.elapsed(), true);
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        self.reporter
            .completed(EventKind::Action, title, Some(&description));
        Ok(out)
    }
}

/// Normalize paths and keep the last content per path, in first-seen order.
fn collapse_entries(entries: &[FileEntry]) -> Result<Vec<(String, &str)>, SandboxError> {
    let mut batch: Vec<(String, &str)> = Vec::with_capacity(entries.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for entry in entries {
        let path = normalize_path(&entry.path)?;
        match index.get(&path) {
            Some(&i) => batch[i].1 = entry.content.as_str(),
            None => {
                index.insert(path.clone(), batch.len());
                batch.push((path, entry.content.as_str()));
            }
        }
    }
    Ok(batch)
}

fn preview(text: &str) -> String {
    if text.chars().count() <= DESCRIPTION_LIMIT {
        return text.to_string();
    }
    let cut: String = text.chars().take(DESCRIPTION_LIMIT).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressHub;
    use crate::sandbox::{LocalSandboxProvider, SandboxProvider};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory sandbox with scripted command results.
    #[derive(Default)]
    struct FakeSandbox {
        files: Mutex<HashMap<String, String>>,
        writes: Mutex<usize>,
        renewals: Mutex<usize>,
        commands: Mutex<VecDeque<Result<CommandOutput, SandboxError>>>,
        gone: bool,
    }

    impl FakeSandbox {
        fn with_commands(results: Vec<Result<CommandOutput, SandboxError>>) -> Self {
            Self {
                commands: Mutex::new(results.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn id(&self) -> &str {
            "fake"
        }

        async fn execute(
            &self,
            _command: &str,
            _timeout: Duration,
            output: Option<mpsc::UnboundedSender<OutputChunk>>,
        ) -> Result<CommandOutput, SandboxError> {
            let next = self
                .commands
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()));
            if let (Some(tx), Ok(out)) = (output, &next) {
                if !out.stdout.is_empty() {
                    tx.send(OutputChunk::Stdout(out.stdout.clone())).unwrap();
                }
            }
            next
        }

        async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
            *self.writes.lock().unwrap() += 1;
            self.files.lock().unwrap().insert(path.to_string(), content.to_string());
            Ok(())
        }

        async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| SandboxError::FileNotFound(path.to_string()))
        }

        async fn set_timeout(&self, _timeout: Duration) -> Result<(), SandboxError> {
            if self.gone {
                return Err(SandboxError::Unavailable("expired".to_string()));
            }
            *self.renewals.lock().unwrap() += 1;
            Ok(())
        }

        fn host(&self, port: u16) -> String {
            format!("{}-fake.test", port)
        }
    }

    fn tools(sandbox: Arc<FakeSandbox>, hub: &ProgressHub) -> SandboxTools {
        SandboxTools::new(
            sandbox,
            ProgressReporter::new(hub.clone(), "job"),
            Duration::from_secs(1800),
            Duration::from_secs(120),
        )
    }

    fn ok(stdout: &str) -> Result<CommandOutput, SandboxError> {
        Ok(CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    #[test]
    fn test_classify_command() {
        assert_eq!(classify_command("npm install react"), CommandClass::Install);
        assert_eq!(classify_command("npm i -D tailwindcss"), CommandClass::Install);
        assert_eq!(classify_command("pnpm add zod"), CommandClass::Install);
        assert_eq!(classify_command("npm run build"), CommandClass::Build);
        assert_eq!(classify_command("npx next dev"), CommandClass::DevServer);
        assert_eq!(classify_command("cat package.json"), CommandClass::Other);
        assert_eq!(classify_command("ls -la"), CommandClass::Other);
    }

    #[tokio::test]
    async fn test_visible_command_events() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe("job");
        let sandbox = Arc::new(FakeSandbox::with_commands(vec![ok("added 3 packages\n")]));
        let tools = tools(sandbox.clone(), &hub);

        let out = tools.execute("npm install react").await.unwrap();
        assert_eq!(out.stdout, "added 3 packages\n");

        let phases: Vec<_> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![EventPhase::Started, EventPhase::InProgress, EventPhase::Completed]
        );
        assert_eq!(*sandbox.renewals.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trivial_command_emits_completed_only() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe("job");
        let sandbox = Arc::new(FakeSandbox::with_commands(vec![ok("{}\n")]));
        let tools = tools(sandbox, &hub);

        tools.execute("cat package.json").await.unwrap();

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, EventPhase::Completed);
    }

    #[tokio::test]
    async fn test_timeout_reports_failed_and_returns_error() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe("job");
        let sandbox = Arc::new(FakeSandbox::with_commands(vec![Err(SandboxError::Timeout(120_000))]));
        let tools = tools(sandbox, &hub);

        let err = tools.execute("npm run build").await.unwrap_err();
        assert!(!err.is_fatal());

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.last().unwrap().phase, EventPhase::Failed);
        assert!(events.last().unwrap().duration_seconds.is_some());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_output() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe("job");
        let sandbox = Arc::new(FakeSandbox::with_commands(vec![Ok(CommandOutput {
            stdout: String::new(),
            stderr: "missing script".to_string(),
            exit_code: 1,
        })]));
        let tools = tools(sandbox, &hub);

        let out = tools.execute("ls nope").await.unwrap();
        assert_eq!(out.exit_code, 1);
        assert_eq!(sub.try_recv().unwrap().phase, EventPhase::Failed);
    }

    #[tokio::test]
    async fn test_write_files_merges_and_collapses_duplicates() {
        let hub = ProgressHub::new();
        let sandbox = Arc::new(FakeSandbox::default());
        let tools = tools(sandbox.clone(), &hub);

        let entries = vec![
            FileEntry::new("/app/page.tsx", "draft"),
            FileEntry::new("app/layout.tsx", "layout"),
            FileEntry::new("app/page.tsx", "page"),
        ];
        let files = tools.write_files(&entries, &FileMap::new()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files.get("app/page.tsx").map(String::as_str), Some("page"));
        assert_eq!(*sandbox.writes.lock().unwrap(), 2);
        assert_eq!(
            sandbox.files.lock().unwrap().get("app/page.tsx").map(String::as_str),
            Some("page")
        );

        // Same content again still reaches the sandbox; the map is unchanged.
        let again = tools.write_files(&entries, &files).await.unwrap();
        assert_eq!(again, files);
        assert_eq!(*sandbox.writes.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_rewrite_restores_file_removed_by_command() {
        let temp = tempfile::tempdir().unwrap();
        let provider = LocalSandboxProvider::new(temp.path());
        let id = provider.create("nextjs", Duration::from_secs(60)).await.unwrap();
        let sandbox = provider.connect(&id).await.unwrap();
        let tools = SandboxTools::new(
            sandbox,
            ProgressReporter::detached(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );

        let entry = [FileEntry::new("app/page.tsx", "A")];
        let files = tools.write_files(&entry, &FileMap::new()).await.unwrap();
        let out = tools.execute("rm app/page.tsx").await.unwrap();
        assert_eq!(out.exit_code, 0);

        let files = tools.write_files(&entry, &files).await.unwrap();
        assert_eq!(files.get("app/page.tsx").map(String::as_str), Some("A"));
        let read = tools.read_files(&["app/page.tsx".to_string()]).await.unwrap();
        assert_eq!(read, vec![FileEntry::new("app/page.tsx", "A")]);
    }

    #[tokio::test]
    async fn test_multi_file_write_is_user_visible() {
        let hub = ProgressHub::new();
        let mut sub = hub.subscribe("job");
        let tools = tools(Arc::new(FakeSandbox::default()), &hub);

        tools
            .write_files(&[FileEntry::new("a.txt", "a"), FileEntry::new("b.txt", "b")], &FileMap::new())
            .await
            .unwrap();
        tools
            .write_files(&[FileEntry::new("c.txt", "c")], &FileMap::new())
            .await
            .unwrap();

        let phases: Vec<_> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![EventPhase::Started, EventPhase::Completed, EventPhase::Completed]
        );
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let hub = ProgressHub::new();
        let tools = tools(Arc::new(FakeSandbox::default()), &hub);

        let err = tools
            .write_files(&[FileEntry::new("../../etc/passwd", "x")], &FileMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_read_files() {
        let hub = ProgressHub::new();
        let sandbox = Arc::new(FakeSandbox::default());
        let tools = tools(sandbox, &hub);

        tools
            .write_files(&[FileEntry::new("app/page.tsx", "page")], &FileMap::new())
            .await
            .unwrap();
        let read = tools.read_files(&["app/page.tsx".to_string()]).await.unwrap();
        assert_eq!(read, vec![FileEntry::new("app/page.tsx", "page")]);

        let err = tools.read_files(&["missing.tsx".to_string()]).await.unwrap_err();
        assert!(matches!(err, SandboxError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_vanished_sandbox_is_fatal() {
        let hub = ProgressHub::new();
        let sandbox = Arc::new(FakeSandbox {
            gone: true,
            ..Default::default()
        });
        let tools = tools(sandbox, &hub);

        let err = tools.execute("ls").await.unwrap_err();
        assert!(err.is_fatal());
    }
}
