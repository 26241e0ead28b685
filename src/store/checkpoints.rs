// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable step outputs, keyed by job, run, and step.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::{now_millis, Store};
use crate::error::StoreError;

impl Store {
    pub fn get_checkpoint(&self, job_id: &str, run_id: &str, step_key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .query_row(
                "SELECT output_json FROM step_checkpoints \
                 WHERE job_id = ?1 AND run_id = ?2 AND step_key = ?3",
                params![job_id, run_id, step_key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    /// Record a step output. The first write for a key wins; the stored
    /// value is returned so a late writer adopts the winner's output.
    pub fn put_checkpoint(&self, job_id: &str, run_id: &str, step_key: &str, output: &Value) -> Result<Value, StoreError> {
        let encoded = serde_json::to_string(output)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO step_checkpoints (job_id, run_id, step_key, output_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(job_id, run_id, step_key) DO NOTHING",
            params![job_id, run_id, step_key, encoded, now_millis()],
        )?;
        let stored: String = conn.query_row(
            "SELECT output_json FROM step_checkpoints \
             WHERE job_id = ?1 AND run_id = ?2 AND step_key = ?3",
            params![job_id, run_id, step_key],
            |row| row.get(0),
        )?;
        Ok(serde_json::from_str(&stored)?)
    }

    pub fn checkpoint_count(&self, job_id: &str, run_id: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM step_checkpoints WHERE job_id = ?1 AND run_id = ?2",
            params![job_id, run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Checkpoints held for a job across all of its runs.
    pub fn job_checkpoint_count(&self, job_id: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM step_checkpoints WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drop the checkpoints of one run once nothing can replay it.
    pub fn clear_checkpoints(&self, job_id: &str, run_id: &str) -> Result<usize, StoreError> {
        Ok(self.conn().execute(
            "DELETE FROM step_checkpoints WHERE job_id = ?1 AND run_id = ?2",
            params![job_id, run_id],
        )?)
    }
}
