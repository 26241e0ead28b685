// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool call execution.

use serde::{Deserialize, Serialize};

#[cfg(feature = "telemetry")]
use tracing::debug;

use super::{truncate_output, AgentTool, MAX_OUTPUT_LINES};
use crate::error::SandboxError;
use crate::sandbox::{CommandOutput, FileMap, SandboxTools};
use crate::types::{ToolCall, ToolResult};

/// What a tool call produced.
///
/// `files` is the complete file map after a successful write; the caller
/// replaces its own map with it. Both fields are plain data so an outcome
/// can be checkpointed and replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub result: ToolResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FileMap>,
}

impl ToolOutcome {
    fn result(result: ToolResult) -> Self {
        Self { result, files: None }
    }
}

/// Execute `call` against the sandbox.
///
/// Bad input and recoverable sandbox failures come back as an error
/// [`ToolResult`]; only a fatal sandbox error is returned as `Err`.
pub async fn dispatch(tools: &SandboxTools, call: &ToolCall, files: &FileMap) -> Result<ToolOutcome, SandboxError> {
    let tool = match AgentTool::from_call(call) {
        Ok(tool) => tool,
        Err(e) => {
            #[cfg(feature = "telemetry")]
            debug!(tool = %call.name, error = %e, "Rejected tool call");
            return Ok(ToolOutcome::result(ToolResult::error(&call.id, format!("Error: {}", e))));
        }
    };

    match tool {
        AgentTool::Terminal { command } => match tools.execute(&command).await {
            Ok(output) => {
                let content = format_command_output(&output);
                Ok(ToolOutcome::result(if output.success() {
                    ToolResult::success(&call.id, content)
                } else {
                    ToolResult::error(&call.id, content)
                }))
            }
            Err(e) => recover(call, e),
        },
        AgentTool::CreateOrUpdateFiles { files: entries } => match tools.write_files(&entries, files).await {
            Ok(updated) => {
                let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
                Ok(ToolOutcome {
                    result: ToolResult::success(
                        &call.id,
                        format!("Updated {} file(s): {}", paths.len(), paths.join(", ")),
                    ),
                    files: Some(updated),
                })
            }
            Err(e) => recover(call, e),
        },
        AgentTool::ReadFiles { files: paths } => match tools.read_files(&paths).await {
            Ok(entries) => {
                let content = serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string());
                Ok(ToolOutcome::result(ToolResult::success(&call.id, content)))
            }
            Err(e) => recover(call, e),
        },
    }
}

fn recover(call: &ToolCall, err: SandboxError) -> Result<ToolOutcome, SandboxError> {
    if err.is_fatal() {
        return Err(err);
    }
    Ok(ToolOutcome::result(ToolResult::error(&call.id, format!("Error: {}", err))))
}

fn format_command_output(output: &CommandOutput) -> String {
    let mut parts = Vec::new();

    if !output.stdout.is_empty() {
        parts.push(truncate_output(&output.stdout, MAX_OUTPUT_LINES));
    }
    if !output.stderr.is_empty() {
        parts.push(format!(
            "[stderr]\n{}",
            truncate_output(&output.stderr, MAX_OUTPUT_LINES / 4)
        ));
    }
    if !output.success() {
        parts.push(format!("[exit code: {}]", output.exit_code));
    }

    if parts.is_empty() {
        "[No output]".to_string()
    } else {
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressReporter;
    use crate::sandbox::{LocalSandboxProvider, SandboxProvider};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn local_tools(root: &std::path::Path) -> SandboxTools {
        let provider = LocalSandboxProvider::new(root);
        let id = provider.create("nextjs", Duration::from_secs(600)).await.unwrap();
        let sandbox = provider.connect(&id).await.unwrap();
        SandboxTools::new(
            sandbox,
            ProgressReporter::detached(),
            Duration::from_secs(600),
            Duration::from_secs(10),
        )
    }

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[test]
    fn test_format_command_output() {
        let out = CommandOutput {
            stdout: "ok".to_string(),
            stderr: "warn".to_string(),
            exit_code: 2,
        };
        assert_eq!(format_command_output(&out), "ok\n[stderr]\nwarn\n[exit code: 2]");
        assert_eq!(format_command_output(&CommandOutput::default()), "[No output]");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let temp = tempdir().unwrap();
        let tools = local_tools(temp.path()).await;

        let outcome = dispatch(&tools, &call("deploy", json!({})), &FileMap::new())
            .await
            .unwrap();
        assert!(outcome.result.is_error());
        assert!(outcome.result.content.contains("Unknown tool"));
        assert!(outcome.files.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip_through_sandbox() {
        let temp = tempdir().unwrap();
        let tools = local_tools(temp.path()).await;

        let outcome = dispatch(
            &tools,
            &call(
                "createOrUpdateFiles",
                json!({"files": [{"path": "app/page.tsx", "content": "export default 1"}]}),
            ),
            &FileMap::new(),
        )
        .await
        .unwrap();
        let files = outcome.files.unwrap();
        assert_eq!(files.len(), 1);

        let outcome = dispatch(&tools, &call("readFiles", json!({"files": ["app/page.tsx"]})), &files)
            .await
            .unwrap();
        assert!(!outcome.result.is_error());
        assert!(outcome.result.content.contains("export default 1"));

        let outcome = dispatch(&tools, &call("readFiles", json!({"files": ["nope.tsx"]})), &files)
            .await
            .unwrap();
        assert!(outcome.result.is_error());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_error_result() {
        let temp = tempdir().unwrap();
        let tools = local_tools(temp.path()).await;

        let outcome = dispatch(&tools, &call("terminal", json!({"command": "echo nope >&2; exit 1"})), &FileMap::new())
            .await
            .unwrap();
        assert!(outcome.result.is_error());
        assert!(outcome.result.content.contains("[exit code: 1]"));
    }

    #[tokio::test]
    async fn test_removed_sandbox_is_fatal() {
        let temp = tempdir().unwrap();
        let tools = local_tools(temp.path()).await;
        std::fs::remove_dir_all(temp.path().join(tools.sandbox_id())).unwrap();

        let err = dispatch(&tools, &call("terminal", json!({"command": "ls"})), &FileMap::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
