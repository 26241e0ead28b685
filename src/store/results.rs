// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Terminal writes and the outward job record.

#[cfg(feature = "telemetry")]
use std::time::Instant;

use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use super::jobs::message_from_row;
use super::types::{Fragment, JobRecord, JobStatus, Lease, MessageKind, MessageRole, NewFragment};
use super::{now_millis, Store};
use crate::error::StoreError;
use crate::sandbox::FileMap;

/// Message persisted for every failed job. Internal errors are never shown.
pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong, please try again";

/// What a successful run leaves behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRecord {
    /// User-facing assistant reply.
    pub message: String,
    /// Generated files, absent for plain-text answers.
    pub fragment: Option<NewFragment>,
}

/// Result of a terminal write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed {
        message_id: String,
        fragment_id: Option<String>,
    },
    /// The job already reached a terminal state.
    AlreadyTerminal,
    /// Another run owns the job.
    NotOwner,
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Flip the owned `PENDING` job to `status`, or explain why not.
fn finish_job(tx: &Transaction<'_>, job_id: &str, lease: &Lease, status: JobStatus, now: i64) -> Result<Option<CommitOutcome>, StoreError> {
    let changed = tx.execute(
        "UPDATE jobs SET status = ?4, lease_expires_at = NULL, updated_at = ?5 \
         WHERE id = ?1 AND status = 'PENDING' AND run_id = ?2 AND lease_epoch = ?3",
        params![job_id, lease.run_id, lease.epoch, status.as_str(), now],
    )?;
    if changed == 1 {
        return Ok(None);
    }

    let current: Option<String> = tx
        .query_row("SELECT status FROM jobs WHERE id = ?1", params![job_id], |row| row.get(0))
        .optional()?;
    match current {
        None => Err(StoreError::JobNotFound(job_id.to_string())),
        Some(s) if s.parse::<JobStatus>()?.is_terminal() => Ok(Some(CommitOutcome::AlreadyTerminal)),
        Some(_) => Ok(Some(CommitOutcome::NotOwner)),
    }
}

fn insert_message(tx: &Transaction<'_>, job_id: &str, kind: MessageKind, content: &str, now: i64) -> Result<String, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO messages (id, job_id, role, kind, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, job_id, MessageRole::Assistant.as_str(), kind.as_str(), content, now],
    )?;
    Ok(id)
}

impl Store {
    /// Mark the job `COMPLETED` and persist the reply and fragment atomically.
    pub fn commit_success(&self, job_id: &str, lease: &Lease, record: &SuccessRecord) -> Result<CommitOutcome, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let now = now_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if let Some(outcome) = finish_job(&tx, job_id, lease, JobStatus::Completed, now)? {
            return Ok(outcome);
        }

        let message_id = insert_message(&tx, job_id, MessageKind::Result, &record.message, now)?;
        let fragment_id = match &record.fragment {
            Some(fragment) => {
                let id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO fragments \
                     (id, message_id, job_id, sandbox_url, title, files_json, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        id,
                        message_id,
                        job_id,
                        fragment.sandbox_url,
                        fragment.title,
                        serde_json::to_string(&fragment.files)?,
                        now
                    ],
                )?;
                Some(id)
            }
            None => None,
        };
        tx.commit()?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.commit_success", start.elapsed());

        Ok(CommitOutcome::Committed { message_id, fragment_id })
    }

    /// Mark the job `ERROR` and persist the generic failure message.
    pub fn commit_failure(&self, job_id: &str, lease: &Lease) -> Result<CommitOutcome, StoreError> {
        let now = now_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if let Some(outcome) = finish_job(&tx, job_id, lease, JobStatus::Error, now)? {
            return Ok(outcome);
        }
        let message_id = insert_message(&tx, job_id, MessageKind::Error, GENERIC_FAILURE_MESSAGE, now)?;
        tx.commit()?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.increment("store.commit_failure");

        Ok(CommitOutcome::Committed { message_id, fragment_id: None })
    }

    /// Fragment attached to the job's latest successful message.
    pub fn latest_fragment(&self, job_id: &str) -> Result<Option<Fragment>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, message_id, job_id, sandbox_url, title, files_json, created_at, updated_at \
                 FROM fragments WHERE job_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![job_id],
                |row| {
                    Ok((
                        Fragment {
                            id: row.get(0)?,
                            message_id: row.get(1)?,
                            job_id: row.get(2)?,
                            sandbox_url: row.get(3)?,
                            title: row.get(4)?,
                            files: FileMap::new(),
                            created_at: row.get(6)?,
                            updated_at: row.get(7)?,
                        },
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(mut fragment, files_json)| {
            fragment.files = serde_json::from_str(&files_json)?;
            Ok(fragment)
        })
        .transpose()
    }

    /// Rewrite the file set of the job's fragment in place.
    pub fn apply_fragment_update(&self, job_id: &str, files: &FileMap) -> Result<Fragment, StoreError> {
        let existing = self
            .latest_fragment(job_id)?
            .ok_or_else(|| StoreError::FragmentNotFound(job_id.to_string()))?;

        let now = now_millis();
        self.conn().execute(
            "UPDATE fragments SET files_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![existing.id, serde_json::to_string(files)?, now],
        )?;

        Ok(Fragment {
            files: files.clone(),
            updated_at: now,
            ..existing
        })
    }

    /// Outward view of the job: status, last assistant message, fragment.
    pub fn record(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        let job = self.get_job(job_id)?;

        let last = {
            let conn = self.conn();
            conn.query_row(
                "SELECT id, job_id, role, kind, content, created_at FROM messages \
                 WHERE job_id = ?1 AND role = 'ASSISTANT' \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![job_id],
                message_from_row,
            )
            .optional()?
        };

        let generation_seconds = match (job.status.is_terminal(), job.started_at) {
            (true, Some(started)) => Some((job.updated_at - started).max(0) as f64 / 1000.0),
            _ => None,
        };

        Ok(JobRecord {
            job_id: job.id.clone(),
            status: job.status,
            final_message: last.map(|m| m.content).unwrap_or_default(),
            fragment: if job.status == JobStatus::Completed {
                self.latest_fragment(job_id)?
            } else {
                None
            },
            generation_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed(store: &Store) -> (String, Lease) {
        let job = store.create_job("o", "p", "build a todo list").unwrap();
        let lease = store.claim(&job.id, "run-1", now_millis() + 60_000).unwrap().unwrap();
        (job.id, lease)
    }

    fn success() -> SuccessRecord {
        let mut files = FileMap::new();
        files.insert("app/page.tsx".to_string(), "export default 1".to_string());
        SuccessRecord {
            message: "Built a todo app".to_string(),
            fragment: Some(NewFragment {
                sandbox_url: "https://3000-sbx.example.dev".to_string(),
                title: "Todo App".to_string(),
                files,
            }),
        }
    }

    #[test]
    fn test_commit_success_writes_everything() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, lease) = claimed(&store);

        let outcome = store.commit_success(&job_id, &lease, &success()).unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { fragment_id: Some(_), .. }));

        let record = store.record(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.final_message, "Built a todo app");
        let fragment = record.fragment.unwrap();
        assert_eq!(fragment.title, "Todo App");
        assert_eq!(fragment.files["app/page.tsx"], "export default 1");
        assert!(record.generation_seconds.is_some());
    }

    #[test]
    fn test_terminal_write_is_exclusive() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, lease) = claimed(&store);

        assert!(store.commit_failure(&job_id, &lease).unwrap().is_committed());
        assert_eq!(
            store.commit_success(&job_id, &lease, &success()).unwrap(),
            CommitOutcome::AlreadyTerminal
        );

        let record = store.record(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.final_message, GENERIC_FAILURE_MESSAGE);
        assert!(record.fragment.is_none());
    }

    #[test]
    fn test_foreign_run_cannot_commit() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, lease) = claimed(&store);

        assert_eq!(
            store.commit_failure(&job_id, &Lease::new("run-2", lease.epoch)).unwrap(),
            CommitOutcome::NotOwner
        );
        // Same run id under an older epoch was replaced by a takeover.
        assert_eq!(
            store.commit_failure(&job_id, &Lease::new("run-1", lease.epoch - 1)).unwrap(),
            CommitOutcome::NotOwner
        );
        assert_eq!(store.get_job(&job_id).unwrap().status, JobStatus::Pending);
        assert!(matches!(
            store.commit_failure("missing", &lease),
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_apply_fragment_update() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, lease) = claimed(&store);
        store.commit_success(&job_id, &lease, &success()).unwrap();

        let mut files = FileMap::new();
        files.insert("app/page.tsx".to_string(), "edited".to_string());
        let updated = store.apply_fragment_update(&job_id, &files).unwrap();
        assert_eq!(updated.files, files);
        assert_eq!(store.latest_fragment(&job_id).unwrap().unwrap().files, files);
    }

    #[test]
    fn test_update_without_fragment() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, _) = claimed(&store);
        assert!(matches!(
            store.apply_fragment_update(&job_id, &FileMap::new()),
            Err(StoreError::FragmentNotFound(_))
        ));
    }

    #[test]
    fn test_pending_record() {
        let store = Store::open_in_memory().unwrap();
        let (job_id, _) = claimed(&store);
        let record = store.record(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.final_message.is_empty());
        assert!(record.generation_seconds.is_none());
    }
}
