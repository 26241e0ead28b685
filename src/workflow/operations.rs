// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Direct file edits against a finished job's sandbox.
//!
//! These bypass the agent loop: each operation becomes one shell command in
//! the sandbox and is folded into the fragment's file set, which is then
//! saved back over the same fragment.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[cfg(feature = "telemetry")]
use tracing::{debug, warn};

use super::step::StepContext;
use super::{TerminalResult, WorkflowController};
use crate::agent::StepRunner;
use crate::error::{AgentError, SandboxError, WorkflowError};
use crate::progress::{EventKind, ProgressReporter};
use crate::sandbox::{normalize_path, FileEntry, FileMap, SandboxTools};
use crate::store::{Fragment, JobStatus, Store};

const SAVING_FILES: &str = "Saving files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One user edit to the file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FileOperation {
    Create { path: String, kind: EntryKind },
    Rename { old_path: String, new_path: String },
    Delete { path: String },
}

impl FileOperation {
    /// Same operation with every path normalized.
    pub fn normalized(&self) -> Result<Self, SandboxError> {
        Ok(match self {
            Self::Create { path, kind } => Self::Create {
                path: normalize_path(path)?,
                kind: *kind,
            },
            Self::Rename { old_path, new_path } => Self::Rename {
                old_path: normalize_path(old_path)?,
                new_path: normalize_path(new_path)?,
            },
            Self::Delete { path } => Self::Delete {
                path: normalize_path(path)?,
            },
        })
    }

    /// Shell command performing the operation. Paths must be normalized.
    pub fn command(&self) -> String {
        match self {
            Self::Create {
                path,
                kind: EntryKind::Directory,
            } => format!("mkdir -p {}", shell_quote(path)),
            Self::Create {
                path,
                kind: EntryKind::File,
            } => format!("{}touch {}", ensure_parent(path), shell_quote(path)),
            Self::Rename { old_path, new_path } => format!(
                "{}mv {} {}",
                ensure_parent(new_path),
                shell_quote(old_path),
                shell_quote(new_path)
            ),
            Self::Delete { path } => format!("rm -rf {}", shell_quote(path)),
        }
    }

    /// Fold the operation into a file map. Renames and deletes also apply
    /// to everything under a directory path.
    pub fn apply(&self, files: &mut FileMap) {
        match self {
            Self::Create {
                path,
                kind: EntryKind::File,
            } => {
                files.entry(path.clone()).or_default();
            }
            Self::Create { .. } => {}
            Self::Rename { old_path, new_path } => {
                let moved: Vec<String> = files
                    .keys()
                    .filter(|key| under(key, old_path))
                    .cloned()
                    .collect();
                for key in moved {
                    if let Some(content) = files.remove(&key) {
                        files.insert(format!("{}{}", new_path, &key[old_path.len()..]), content);
                    }
                }
            }
            Self::Delete { path } => files.retain(|key, _| !under(key, path)),
        }
    }
}

/// `key` is `path` itself or lives below it.
fn under(key: &str, path: &str) -> bool {
    key == path || (key.starts_with(path) && key[path.len()..].starts_with('/'))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn ensure_parent(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            format!("mkdir -p {} && ", shell_quote(&parent.to_string_lossy()))
        }
        _ => String::new(),
    }
}

async fn run_operation(tools: &SandboxTools, command: &str) -> Result<(), AgentError> {
    let output = tools.execute(command).await?;
    if !output.success() {
        return Err(SandboxError::CommandFailed(format!(
            "`{}` exited with {}: {}",
            command,
            output.exit_code,
            output.stderr.trim()
        ))
        .into());
    }
    Ok(())
}

async fn write_all(tools: &SandboxTools, entries: &[FileEntry], current: &FileMap) -> Result<FileMap, AgentError> {
    Ok(tools.write_files(entries, current).await?)
}

async fn save_files(store: &Store, job_id: &str, files: &FileMap) -> Result<Fragment, AgentError> {
    Ok(store.apply_fragment_update(job_id, files)?)
}

impl WorkflowController {
    /// Connect to the sandbox behind a completed job's fragment.
    async fn attach(&self, job_id: &str) -> Result<(Fragment, Arc<SandboxTools>, ProgressReporter), WorkflowError> {
        let job = self.store.get_job(job_id)?;
        if job.status != JobStatus::Completed {
            return Err(WorkflowError::InvalidTrigger(format!(
                "job {} is {}, file updates need a completed job",
                job_id, job.status
            )));
        }
        let fragment = self
            .store
            .latest_fragment(job_id)?
            .ok_or_else(|| WorkflowError::InvalidTrigger(format!("job {} has no fragment", job_id)))?;
        let sandbox_ref = job
            .sandbox_ref
            .ok_or_else(|| WorkflowError::InvalidTrigger(format!("job {} has no sandbox", job_id)))?;

        let sandbox = self
            .sandboxes
            .connect(&sandbox_ref)
            .await
            .map_err(AgentError::from)?;
        let reporter = ProgressReporter::new(self.hub.clone(), job_id);
        let tools = Arc::new(SandboxTools::new(
            sandbox,
            reporter.clone(),
            self.settings.idle_timeout,
            self.settings.command_timeout,
        ));
        Ok((fragment, tools, reporter))
    }

    fn edit_context(&self, job_id: &str) -> StepContext {
        let run_id = format!("edit-{}", uuid::Uuid::new_v4().simple());
        StepContext::new(self.store.clone(), job_id, run_id, self.settings.retry)
    }

    /// An edit run is never resumed, so its checkpoints go as soon as it ends.
    fn finish_edit(&self, ctx: &StepContext) {
        if let Err(e) = self.store.clear_checkpoints(ctx.job_id(), ctx.run_id()) {
            #[cfg(feature = "telemetry")]
            warn!(job_id = ctx.job_id(), run_id = ctx.run_id(), "Failed to clear edit checkpoints: {}", e);
            #[cfg(not(feature = "telemetry"))]
            let _ = e;
        }
        self.hub.close(ctx.job_id());
    }

    async fn save(
        &self,
        ctx: &mut StepContext,
        reporter: &ProgressReporter,
        job_id: &str,
        files: &FileMap,
    ) -> Result<TerminalResult, WorkflowError> {
        reporter.started(EventKind::Step, SAVING_FILES, None);
        let saved = ctx
            .step("save-files", || save_files(&self.store, job_id, files))
            .await;
        match saved {
            Ok(fragment) => {
                reporter.completed(EventKind::Step, SAVING_FILES, None);
                Ok(TerminalResult::FilesUpdated {
                    job_id: job_id.to_string(),
                    fragment_id: fragment.id,
                    files: fragment.files.len(),
                })
            }
            Err(e) => {
                reporter.failed(EventKind::Step, SAVING_FILES, Some(&e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Apply create/rename/delete operations to a completed job's sandbox
    /// and fragment.
    pub async fn apply_file_operations(&self, job_id: &str, operations: &[FileOperation]) -> Result<TerminalResult, WorkflowError> {
        let operations = operations
            .iter()
            .map(FileOperation::normalized)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| WorkflowError::InvalidTrigger(e.to_string()))?;

        let (fragment, tools, reporter) = self.attach(job_id).await?;
        let mut ctx = self.edit_context(job_id);
        let result = self
            .run_operations(&mut ctx, &reporter, &tools, &operations, fragment.files)
            .await;
        self.finish_edit(&ctx);
        result
    }

    async fn run_operations(
        &self,
        ctx: &mut StepContext,
        reporter: &ProgressReporter,
        tools: &SandboxTools,
        operations: &[FileOperation],
        mut files: FileMap,
    ) -> Result<TerminalResult, WorkflowError> {
        let job_id = ctx.job_id().to_string();
        for (i, operation) in operations.iter().enumerate() {
            let command = operation.command();
            #[cfg(feature = "telemetry")]
            debug!(job_id = %job_id, %command, "Applying file operation");

            ctx.step(&format!("file-op-{}", i + 1), || run_operation(tools, &command))
                .await?;
            operation.apply(&mut files);
        }

        self.save(ctx, reporter, &job_id, &files).await
    }

    /// Write user-edited files into the job's sandbox and save them over
    /// the fragment's file set.
    pub async fn push_files(&self, job_id: &str, edited: &FileMap) -> Result<TerminalResult, WorkflowError> {
        let entries = edited
            .iter()
            .map(|(path, content)| FileEntry::new(path.as_str(), content.as_str()))
            .collect::<Vec<_>>();

        let (fragment, tools, reporter) = self.attach(job_id).await?;
        let mut ctx = self.edit_context(job_id);
        let result = self
            .write_edits(&mut ctx, &reporter, &tools, &entries, &fragment.files)
            .await;
        self.finish_edit(&ctx);
        result
    }

    async fn write_edits(
        &self,
        ctx: &mut StepContext,
        reporter: &ProgressReporter,
        tools: &SandboxTools,
        entries: &[FileEntry],
        current: &FileMap,
    ) -> Result<TerminalResult, WorkflowError> {
        let files: FileMap = ctx
            .step("push-files", || write_all(tools, entries, current))
            .await?;

        let job_id = ctx.job_id().to_string();
        self.save(ctx, reporter, &job_id, &files).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> FileMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rename_moves_directory_contents() {
        let mut files = map(&[("app/page.tsx", "a"), ("app/lib/x.ts", "b"), ("apple.ts", "c")]);
        FileOperation::Rename {
            old_path: "app".to_string(),
            new_path: "src/app".to_string(),
        }
        .apply(&mut files);

        assert_eq!(
            files,
            map(&[("src/app/page.tsx", "a"), ("src/app/lib/x.ts", "b"), ("apple.ts", "c")])
        );
    }

    #[test]
    fn test_delete_is_prefix_aware() {
        let mut files = map(&[("app/page.tsx", "a"), ("app/lib/x.ts", "b"), ("apple.ts", "c")]);
        FileOperation::Delete {
            path: "app".to_string(),
        }
        .apply(&mut files);
        assert_eq!(files, map(&[("apple.ts", "c")]));
    }

    #[test]
    fn test_create_file_keeps_existing_content() {
        let mut files = map(&[("a.ts", "keep")]);
        for path in ["a.ts", "b.ts"] {
            FileOperation::Create {
                path: path.to_string(),
                kind: EntryKind::File,
            }
            .apply(&mut files);
        }
        FileOperation::Create {
            path: "empty".to_string(),
            kind: EntryKind::Directory,
        }
        .apply(&mut files);

        assert_eq!(files, map(&[("a.ts", "keep"), ("b.ts", "")]));
    }

    #[test]
    fn test_commands_quote_paths() {
        let create = FileOperation::Create {
            path: "app/it's.tsx".to_string(),
            kind: EntryKind::File,
        };
        assert_eq!(create.command(), r"mkdir -p 'app' && touch 'app/it'\''s.tsx'");

        let rename = FileOperation::Rename {
            old_path: "a.ts".to_string(),
            new_path: "lib/b.ts".to_string(),
        };
        assert_eq!(rename.command(), "mkdir -p 'lib' && mv 'a.ts' 'lib/b.ts'");
        assert_eq!(
            FileOperation::Delete { path: "tmp".to_string() }.command(),
            "rm -rf 'tmp'"
        );
    }

    #[test]
    fn test_normalize_rejects_escape() {
        let op = FileOperation::Delete {
            path: "../etc".to_string(),
        };
        assert!(op.normalized().is_err());

        let op = FileOperation::Create {
            path: "/app/x.ts".to_string(),
            kind: EntryKind::File,
        };
        assert_eq!(
            op.normalized().unwrap(),
            FileOperation::Create {
                path: "app/x.ts".to_string(),
                kind: EntryKind::File
            }
        );
    }

    #[test]
    fn test_wire_shape() {
        let op: FileOperation =
            serde_json::from_str(r#"{"op":"rename","oldPath":"a","newPath":"b"}"#).unwrap();
        assert_eq!(
            op,
            FileOperation::Rename {
                old_path: "a".to_string(),
                new_path: "b".to_string()
            }
        );
    }
}
