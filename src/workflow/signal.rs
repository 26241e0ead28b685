// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process signals that suspended workflow steps wait on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

/// Named wake-up signals, one per `(job, name)`.
///
/// A signal sent before anyone waits is kept and consumed by the next waiter.
#[derive(Clone, Default)]
pub struct SignalBus {
    slots: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, job_id: &str, name: &str) -> Arc<Notify> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(format!("{}:{}", job_id, name))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake the step waiting on `name` for `job_id`.
    pub fn signal(&self, job_id: &str, name: &str) {
        self.slot(job_id, name).notify_one();
    }

    /// Wait until `name` is signalled for `job_id`.
    pub async fn wait(&self, job_id: &str, name: &str) {
        let notify = self.slot(job_id, name);
        notify.notified().await;
    }

    /// Forget every signal slot of a job.
    pub fn clear(&self, job_id: &str) {
        let prefix = format!("{}:", job_id);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|key, _| !key.starts_with(&prefix));
    }
}
