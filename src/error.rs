// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for sandforge.
//!
//! This module provides strongly-typed errors for each layer of the system,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation
//! at the binary boundary.

use thiserror::Error;

/// Errors that can occur while talking to the completion service.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("API error: {message}")]
    ApiError {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Context window exceeded: {used} tokens used, {limit} available")]
    ContextWindowExceeded { used: u32, limit: u32 },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Response parsing error: {0}")]
    ParseError(String),

    #[error("Streaming error: {0}")]
    StreamError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl ProviderError {
    /// Create an API error with status code.
    pub fn api(message: impl Into<String>, status_code: u16) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create an API error without status code.
    pub fn api_message(message: impl Into<String>) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::NetworkError(_) | Self::Timeout(_) => true,
            Self::ApiError {
                status_code: Some(code),
                ..
            } => *code >= 500,
            _ => false,
        }
    }

    /// Check if this is a rate limit error.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Errors raised by the remote (or local) sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The sandbox is gone, expired, or could not be reached at all.
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox API error: {message}")]
    Api {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Command timed out after {0}ms")]
    Timeout(u64),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl SandboxError {
    /// Fatal errors abort the whole job; everything else is fed back to the
    /// model as a tool error so it can try another approach.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Api {
                status_code: Some(404),
                ..
            } => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable(err.to_string())
        } else if err.is_timeout() {
            Self::Timeout(0)
        } else {
            Self::Api {
                message: err.to_string(),
                status_code: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

/// Errors that can occur while interpreting a tool call.
///
/// Tool errors are never fatal: they are reported back to the model.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Errors that can occur in the job datastore.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Fragment not found for job: {0}")]
    FragmentNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy(err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors that can occur while running the agent loop or any of its steps.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Turn budget exhausted after {0} turns")]
    TurnBudgetExhausted(usize),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl AgentError {
    /// Whether a step that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Store(e) => e.is_transient(),
            Self::Sandbox(e) => matches!(e, SandboxError::Timeout(_)),
            _ => false,
        }
    }
}

/// Errors surfaced by the workflow controller itself.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Usage rejected: {0}")]
    UsageRejected(String),

    #[error("Timed out waiting for job {0}")]
    WaitTimeout(String),

    #[error("Step failed: {0}")]
    Step(#[from] AgentError),
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::RateLimited("wait 1s".to_string()).is_retryable());
        assert!(ProviderError::NetworkError("timeout".to_string()).is_retryable());
        assert!(ProviderError::Timeout(30000).is_retryable());
        assert!(ProviderError::api("upstream", 502).is_retryable());
        assert!(!ProviderError::api("bad request", 400).is_retryable());
        assert!(!ProviderError::AuthError("invalid key".to_string()).is_retryable());
    }

    #[test]
    fn test_sandbox_error_fatality() {
        assert!(SandboxError::Unavailable("gone".to_string()).is_fatal());
        assert!(SandboxError::Api {
            message: "not found".to_string(),
            status_code: Some(404)
        }
        .is_fatal());
        assert!(!SandboxError::Timeout(1000).is_fatal());
        assert!(!SandboxError::CommandFailed("exit 1".to_string()).is_fatal());
    }

    #[test]
    fn test_sandbox_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SandboxError = io_err.into();
        assert!(matches!(err, SandboxError::FileNotFound(_)));
    }

    #[test]
    fn test_agent_error_transience() {
        let err: AgentError = ProviderError::NetworkError("reset".to_string()).into();
        assert!(err.is_transient());
        let err: AgentError = SandboxError::Unavailable("gone".to_string()).into();
        assert!(!err.is_transient());
        assert!(!AgentError::TurnBudgetExhausted(15).is_transient());
        assert!(!AgentError::Cancelled.is_transient());
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let config_err: ConfigError = result.unwrap_err().into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = AgentError::TurnBudgetExhausted(15);
        assert!(err.to_string().contains("15"));
    }
}
