// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandforge - durable build-agent orchestration.
//!
//! A job carries a user prompt. A tool-calling model works on it inside a
//! remote (or local) sandbox until it declares the task done, and the result
//! is committed as a fragment: the generated files, the sandbox URL, and a
//! title. Every side effect runs as a checkpointed workflow step, so a crashed
//! run resumes where it stopped instead of starting over.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Messages, tool definitions, stream events, the `Provider` trait
//! - [`error`] - Error types per layer
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing and metrics
//! - [`providers`] - Completion services (OpenAI-compatible, scripted)
//! - [`progress`] - Per-job progress event pub/sub
//! - [`sandbox`] - Sandbox backends and the tool-facing adapter
//! - [`tools`] - The closed tool schema and its dispatch
//! - [`agent`] - The tool-calling agent loop
//! - [`store`] - SQLite datastore for jobs, messages, fragments, checkpoints
//! - [`guard`] - Idempotency guard over job ownership
//! - [`workflow`] - Durable workflow controller and job service
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sandforge::progress::ProgressHub;
//! use sandforge::store::Store;
//! use sandforge::workflow::{JobService, WorkflowController, WorkflowSettings};
//!
//! let controller = WorkflowController::new(
//!     Store::open("sandforge.db")?,
//!     provider,
//!     sandboxes,
//!     ProgressHub::new(),
//!     WorkflowSettings::default(),
//! );
//! let service = JobService::new(Arc::new(controller));
//! let job_id = service.submit("owner", "project", "build a todo list").await?;
//! let result = service.generate(&job_id, None).await?;
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod guard;
pub mod progress;
pub mod providers;
pub mod sandbox;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod types;
pub mod workflow;

// Re-export commonly used types at crate root
pub use error::{
    AgentError, ConfigError, ProviderError, Result, SandboxError, StoreError, ToolError, WorkflowError,
};
pub use providers::{create_provider, create_provider_from_config, OpenAIProvider, ProviderType, ScriptedProvider};
pub use types::{
    // Message types
    Message, Role,
    // Tool types
    ToolCall, ToolDefinition, ToolResult,
    // Provider types
    BoxedProvider, CompletionRequest, Provider, SharedProvider, StopReason, StreamEvent, TokenUsage,
};
pub use workflow::{JobService, TerminalResult, Trigger, WorkflowController, WorkflowSettings};

/// Sandforge version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
