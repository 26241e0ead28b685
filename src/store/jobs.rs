// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job rows and their conditional state transitions.
//!
//! Each transition returns `true` (or the new [`Lease`]) when it applied and
//! `false` (or `None`) when the row was not in the expected state; callers
//! re-read and decide. Every transition made on behalf of a run matches both
//! its run id and its lease epoch.

#[cfg(feature = "telemetry")]
use std::time::Instant;

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use super::types::{Job, JobStatus, Lease, MessageKind, MessageRecord, MessageRole};
use super::{now_millis, Store};
use crate::error::StoreError;

const JOB_COLUMNS: &str = "id, owner_id, project_id, status, sandbox_ref, run_id, \
     lease_epoch, lease_expires_at, started_at, created_at, updated_at";

/// Parse a text column into one of the store's enums.
pub(super) fn text_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, StoreError>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        project_id: row.get(2)?,
        status: text_column(row, 3, str::parse)?,
        sandbox_ref: row.get(4)?,
        run_id: row.get(5)?,
        lease_epoch: row.get(6)?,
        lease_expires_at: row.get(7)?,
        started_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub(super) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        role: text_column(row, 2, MessageRole::parse)?,
        kind: text_column(row, 3, MessageKind::parse)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl Store {
    /// Create a `PENDING` job together with the user's prompt message.
    pub fn create_job(&self, owner_id: &str, project_id: &str, prompt: &str) -> Result<Job, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let now = now_millis();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            project_id: project_id.to_string(),
            status: JobStatus::Pending,
            sandbox_ref: None,
            run_id: None,
            lease_epoch: 0,
            lease_expires_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (id, owner_id, project_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'PENDING', ?4, ?4)",
            params![job.id, job.owner_id, job.project_id, now],
        )?;
        tx.execute(
            "INSERT INTO messages (id, job_id, role, kind, content, created_at) \
             VALUES (?1, ?2, 'USER', 'RESULT', ?3, ?4)",
            params![uuid::Uuid::new_v4().to_string(), job.id, prompt, now],
        )?;
        tx.commit()?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.create_job", start.elapsed());

        Ok(job)
    }

    pub fn find_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.find_job(job_id)?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    /// Most recent jobs first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The prompt the job was created with.
    pub fn job_prompt(&self, job_id: &str) -> Result<String, StoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT content FROM messages WHERE job_id = ?1 AND role = 'USER' \
             ORDER BY created_at ASC, rowid ASC LIMIT 1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    /// Messages of earlier jobs in the same project, oldest first.
    pub fn project_history(&self, project_id: &str, before_job: &str, limit: usize) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.job_id, m.role, m.kind, m.content, m.created_at \
             FROM messages m JOIN jobs j ON j.id = m.job_id \
             WHERE j.project_id = ?1 AND m.job_id != ?2 AND m.kind = 'RESULT' \
             ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![project_id, before_job, limit as i64], message_from_row)?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn job_messages(&self, job_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, role, kind, content, created_at FROM messages \
             WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![job_id], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Run a lease-granting UPDATE that bumps the epoch and returns it.
    fn grant_lease(&self, sql: &str, job_id: &str, run_id: &str, lease_until: i64) -> Result<Option<Lease>, StoreError> {
        let epoch: Option<i64> = self
            .conn()
            .query_row(sql, params![job_id, run_id, lease_until, now_millis()], |row| row.get(0))
            .optional()?;
        Ok(epoch.map(|epoch| Lease::new(run_id, epoch)))
    }

    /// Claim an unowned `PENDING` job for `run_id`.
    pub fn claim(&self, job_id: &str, run_id: &str, lease_until: i64) -> Result<Option<Lease>, StoreError> {
        self.grant_lease(
            "UPDATE jobs SET run_id = ?2, lease_epoch = lease_epoch + 1, lease_expires_at = ?3, \
             started_at = ?4, updated_at = ?4 \
             WHERE id = ?1 AND status = 'PENDING' AND run_id IS NULL \
             RETURNING lease_epoch",
            job_id,
            run_id,
            lease_until,
        )
    }

    /// Reset an `ERROR` job to `PENDING` and claim it for a fresh run.
    ///
    /// The previous sandbox binding is dropped; the new run provisions its own.
    pub fn reset_and_claim(&self, job_id: &str, run_id: &str, lease_until: i64) -> Result<Option<Lease>, StoreError> {
        self.grant_lease(
            "UPDATE jobs SET status = 'PENDING', sandbox_ref = NULL, run_id = ?2, \
             lease_epoch = lease_epoch + 1, lease_expires_at = ?3, started_at = ?4, updated_at = ?4 \
             WHERE id = ?1 AND status = 'ERROR' \
             RETURNING lease_epoch",
            job_id,
            run_id,
            lease_until,
        )
    }

    /// Take over a `PENDING` job whose owner `run_id` let its lease lapse.
    /// The run id is kept so the new worker replays the old run's checkpoints;
    /// the epoch moves on so the old worker loses the job.
    pub fn take_over(&self, job_id: &str, run_id: &str, lease_until: i64) -> Result<Option<Lease>, StoreError> {
        self.grant_lease(
            "UPDATE jobs SET lease_epoch = lease_epoch + 1, lease_expires_at = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status = 'PENDING' AND run_id = ?2 \
             AND (lease_expires_at IS NULL OR lease_expires_at < ?4) \
             RETURNING lease_epoch",
            job_id,
            run_id,
            lease_until,
        )
    }

    /// Extend the lease of the owning run.
    pub fn renew_lease(&self, job_id: &str, lease: &Lease, lease_until: i64) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE jobs SET lease_expires_at = ?4, updated_at = ?5 \
             WHERE id = ?1 AND status = 'PENDING' AND run_id = ?2 AND lease_epoch = ?3",
            params![job_id, lease.run_id, lease.epoch, lease_until, now_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Give up ownership without a terminal write. The job stays `PENDING`
    /// and the next trigger resumes the same run.
    pub fn release_lease(&self, job_id: &str, lease: &Lease) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE jobs SET lease_expires_at = 0, updated_at = ?4 \
             WHERE id = ?1 AND status = 'PENDING' AND run_id = ?2 AND lease_epoch = ?3",
            params![job_id, lease.run_id, lease.epoch, now_millis()],
        )?;
        Ok(changed == 1)
    }

    /// Bind `sandbox_ref` to the job if it is unbound (or already bound to it).
    pub fn bind_sandbox(&self, job_id: &str, lease: &Lease, sandbox_ref: &str) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE jobs SET sandbox_ref = ?4, updated_at = ?5 \
             WHERE id = ?1 AND status = 'PENDING' AND run_id = ?2 AND lease_epoch = ?3 \
             AND (sandbox_ref IS NULL OR sandbox_ref = ?4)",
            params![job_id, lease.run_id, lease.epoch, sandbox_ref, now_millis()],
        )?;
        Ok(changed == 1)
    }
}
