// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-job publish/subscribe topics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;

use super::types::{EventKind, EventPhase, ProgressEvent};

/// Default per-topic buffer. A subscriber that falls further behind skips ahead.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Registry of progress topics keyed by job id.
///
/// Cloning is cheap; all clones share the same topics.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    topics: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    fn sender(&self, job_id: &str) -> broadcast::Sender<ProgressEvent> {
        let mut topics = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    /// Publish an event to everyone currently subscribed to `job_id`.
    ///
    /// Never blocks and never fails; an event with no listeners is dropped.
    /// Publishing never opens a topic, only subscribing does.
    pub fn publish(&self, job_id: &str, event: ProgressEvent) {
        let sender = self
            .inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned();
        let delivered = sender.map(|tx| tx.send(event).is_ok()).unwrap_or(false);
        if !delivered {
            tracing::trace!(job_id, "progress event dropped: no subscribers");
        }
    }

    /// Subscribe to events published for `job_id` from now on.
    pub fn subscribe(&self, job_id: &str) -> ProgressSubscription {
        ProgressSubscription {
            job_id: job_id.to_string(),
            rx: self.sender(job_id).subscribe(),
        }
    }

    /// Drop the topic for `job_id`. Subscribers drain what is buffered and then end.
    pub fn close(&self, job_id: &str) {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
    }

    /// Number of open topics.
    pub fn topic_count(&self) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live view of one job's events.
pub struct ProgressSubscription {
    job_id: String,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl ProgressSubscription {
    /// Next event, or `None` once the topic is closed and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %self.job_id, skipped, "progress subscriber lagged");
                }
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Publishes one job's events with non-decreasing timestamps and fills in
/// `durationSeconds` when a `completed`/`failed` event closes a `started` one.
#[derive(Clone)]
pub struct ProgressReporter {
    hub: ProgressHub,
    job_id: Arc<str>,
    state: Arc<Mutex<ReporterState>>,
}

#[derive(Default)]
struct ReporterState {
    last_timestamp: i64,
    open: HashMap<(EventKind, String), Instant>,
}

impl ProgressReporter {
    pub fn new(hub: ProgressHub, job_id: impl Into<String>) -> Self {
        Self {
            hub,
            job_id: Arc::from(job_id.into()),
            state: Arc::new(Mutex::new(ReporterState::default())),
        }
    }

    /// A reporter bound to a throwaway hub nobody listens to.
    pub fn detached() -> Self {
        Self::new(ProgressHub::with_capacity(1), "detached")
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Stamp and publish an event.
    pub fn emit(&self, mut event: ProgressEvent) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let now = chrono::Utc::now().timestamp_millis();
            state.last_timestamp = now.max(state.last_timestamp);
            event.timestamp_millis = state.last_timestamp;

            let key = (event.kind, event.title.clone());
            match event.phase {
                EventPhase::Started => {
                    state.open.insert(key, Instant::now());
                }
                phase if phase.is_terminal() => {
                    if let Some(started) = state.open.remove(&key) {
                        if event.duration_seconds.is_none() {
                            event.duration_seconds = Some(started.elapsed().as_secs_f64());
                        }
                    }
                }
                _ => {}
            }
        }
        self.hub.publish(&self.job_id, event);
    }

    pub fn started(&self, kind: EventKind, title: &str, description: Option<&str>) {
        self.emit(build(kind, EventPhase::Started, title, description));
    }

    pub fn in_progress(&self, kind: EventKind, title: &str, description: Option<&str>) {
        self.emit(build(kind, EventPhase::InProgress, title, description));
    }

    pub fn completed(&self, kind: EventKind, title: &str, description: Option<&str>) {
        self.emit(build(kind, EventPhase::Completed, title, description));
    }

    pub fn failed(&self, kind: EventKind, title: &str, description: Option<&str>) {
        self.emit(build(kind, EventPhase::Failed, title, description));
    }
}

fn build(kind: EventKind, phase: EventPhase, title: &str, description: Option<&str>) -> ProgressEvent {
    let event = ProgressEvent::new(kind, phase, title);
    match description {
        Some(d) => event.with_description(d),
        None => event,
    }
}
