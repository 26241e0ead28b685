// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing and metrics infrastructure.
//!
//! - **Tracing**: structured logging via `tracing`, initialized once by the
//!   binary with [`init_telemetry`]. Job and run ids travel as span fields.
//! - **Metrics**: counters and latency histograms in [`GLOBAL_METRICS`].
//!
//! Public async entry points carry `#[instrument]` when the `telemetry`
//! feature is enabled. Record ids, paths, and counts in spans; never prompt
//! text, file contents, or keys.

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{Histogram, Metrics, MetricsSnapshot, OperationMetrics, ToolMetrics, GLOBAL_METRICS};
