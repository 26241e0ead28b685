// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live progress events.
//!
//! Each job has its own topic on a [`ProgressHub`]. Exactly one
//! [`ProgressReporter`] publishes to a topic while a job runs; any number of
//! [`ProgressSubscription`]s read from it. Delivery is best effort: nothing is
//! replayed to late subscribers and publishing never waits on readers.

mod hub;
mod types;

pub use hub::{ProgressHub, ProgressReporter, ProgressSubscription, DEFAULT_TOPIC_CAPACITY};
pub use types::{EventKind, EventPhase, ProgressEvent};
