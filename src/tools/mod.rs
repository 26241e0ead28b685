// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tools the coding agent can call.
//!
//! The model sees exactly three tools, all backed by the job's sandbox:
//!
//! | Name                  | Input                              |
//! |-----------------------|------------------------------------|
//! | `terminal`            | `{command}`                        |
//! | `createOrUpdateFiles` | `{files: [{path, content}]}`       |
//! | `readFiles`           | `{files: [path]}`                  |
//!
//! [`AgentTool`] is the parsed form of a call; [`dispatch`] runs it and turns
//! every non-fatal failure into an error result for the model.

mod dispatch;

pub use dispatch::{dispatch, ToolOutcome};

use serde::Deserialize;

use crate::error::ToolError;
use crate::sandbox::FileEntry;
use crate::types::{InputSchema, ToolCall, ToolDefinition};

pub const TERMINAL: &str = "terminal";
pub const CREATE_OR_UPDATE_FILES: &str = "createOrUpdateFiles";
pub const READ_FILES: &str = "readFiles";

/// Lines of command output kept in a tool result.
pub const MAX_OUTPUT_LINES: usize = 400;

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentTool {
    Terminal { command: String },
    CreateOrUpdateFiles { files: Vec<FileEntry> },
    ReadFiles { files: Vec<String> },
}

#[derive(Deserialize)]
struct TerminalArgs {
    command: String,
}

#[derive(Deserialize)]
struct WriteArgs {
    files: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct ReadArgs {
    files: Vec<String>,
}

impl AgentTool {
    /// Parse a call by tool name and JSON input.
    pub fn from_call(call: &ToolCall) -> Result<Self, ToolError> {
        match call.name.as_str() {
            TERMINAL => {
                let args: TerminalArgs = parse_arguments(&call.input)?;
                if args.command.trim().is_empty() {
                    return Err(ToolError::InvalidInput("command must not be empty".to_string()));
                }
                Ok(Self::Terminal { command: args.command })
            }
            CREATE_OR_UPDATE_FILES => {
                let args: WriteArgs = parse_arguments(&call.input)?;
                if args.files.is_empty() {
                    return Err(ToolError::MissingParameter("files".to_string()));
                }
                Ok(Self::CreateOrUpdateFiles { files: args.files })
            }
            READ_FILES => {
                let args: ReadArgs = parse_arguments(&call.input)?;
                if args.files.is_empty() {
                    return Err(ToolError::MissingParameter("files".to_string()));
                }
                Ok(Self::ReadFiles { files: args.files })
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Terminal { .. } => TERMINAL,
            Self::CreateOrUpdateFiles { .. } => CREATE_OR_UPDATE_FILES,
            Self::ReadFiles { .. } => READ_FILES,
        }
    }
}

/// Definitions advertised to the model.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(TERMINAL, "Use the terminal to run commands").with_schema(
            InputSchema::new()
                .with_property(
                    "command",
                    serde_json::json!({"type": "string", "description": "Shell command to run"}),
                )
                .with_required(vec!["command".to_string()]),
        ),
        ToolDefinition::new(CREATE_OR_UPDATE_FILES, "Create or update files in the sandbox").with_schema(
            InputSchema::new()
                .with_property(
                    "files",
                    serde_json::json!({
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": {"type": "string"},
                                "content": {"type": "string"}
                            },
                            "required": ["path", "content"]
                        }
                    }),
                )
                .with_required(vec!["files".to_string()]),
        ),
        ToolDefinition::new(READ_FILES, "Read files from the sandbox").with_schema(
            InputSchema::new()
                .with_property(
                    "files",
                    serde_json::json!({"type": "array", "items": {"type": "string"}}),
                )
                .with_required(vec!["files".to_string()]),
        ),
    ]
}

/// Parse JSON arguments into a typed struct.
pub fn parse_arguments<T>(arguments: &serde_json::Value) -> Result<T, ToolError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(arguments.clone())
        .map_err(|err| ToolError::InvalidInput(format!("Failed to parse arguments: {err}")))
}

/// Truncate output by lines, keeping first and last portions.
pub fn truncate_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let total = lines.len();

    if total <= max_lines {
        return output.to_string();
    }

    let keep = max_lines / 2;
    let first_part: Vec<&str> = lines.iter().take(keep).copied().collect();
    let last_part: Vec<&str> = lines.iter().skip(total - keep).copied().collect();
    let omitted = total - keep * 2;

    format!(
        "{}\n\n... [{omitted} lines omitted] ...\n\n{}",
        first_part.join("\n"),
        last_part.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[test]
    fn test_parse_terminal() {
        let tool = AgentTool::from_call(&call("terminal", json!({"command": "npm run build"}))).unwrap();
        assert_eq!(
            tool,
            AgentTool::Terminal {
                command: "npm run build".to_string()
            }
        );
        assert_eq!(tool.name(), TERMINAL);
    }

    #[test]
    fn test_parse_files() {
        let tool = AgentTool::from_call(&call(
            "createOrUpdateFiles",
            json!({"files": [{"path": "app/page.tsx", "content": "x"}]}),
        ))
        .unwrap();
        assert!(matches!(tool, AgentTool::CreateOrUpdateFiles { ref files } if files.len() == 1));

        let tool = AgentTool::from_call(&call("readFiles", json!({"files": ["a", "b"]}))).unwrap();
        assert!(matches!(tool, AgentTool::ReadFiles { ref files } if files.len() == 2));
    }

    #[test]
    fn test_parse_rejects_bad_calls() {
        assert!(matches!(
            AgentTool::from_call(&call("rm_rf", json!({}))),
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            AgentTool::from_call(&call("terminal", json!({"cmd": "ls"}))),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            AgentTool::from_call(&call("terminal", json!({"command": "  "}))),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            AgentTool::from_call(&call("readFiles", json!({"files": []}))),
            Err(ToolError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_definitions_names() {
        let names: Vec<_> = definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec![TERMINAL, CREATE_OR_UPDATE_FILES, READ_FILES]);
    }

    #[test]
    fn test_truncate_output() {
        let text: String = (0..10).map(|i| format!("line{}\n", i)).collect();
        assert_eq!(truncate_output(&text, 20), text);

        let truncated = truncate_output(&text, 4);
        assert!(truncated.starts_with("line0\nline1"));
        assert!(truncated.contains("[6 lines omitted]"));
        assert!(truncated.ends_with("line8\nline9"));
    }
}
