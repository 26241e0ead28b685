// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Schema creation.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 2;

pub(super) fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            sandbox_ref TEXT,
            run_id TEXT,
            lease_epoch INTEGER NOT NULL DEFAULT 0,
            lease_expires_at INTEGER,
            started_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            role TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS fragments (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL UNIQUE,
            job_id TEXT NOT NULL,
            sandbox_url TEXT NOT NULL,
            title TEXT NOT NULL,
            files_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS step_checkpoints (
            job_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            step_key TEXT NOT NULL,
            output_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (job_id, run_id, step_key)
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_job ON messages(job_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_fragments_job ON fragments(job_id);
        "#,
    )?;

    let current_version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    match current_version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(1) => {
            conn.execute_batch(
                "ALTER TABLE jobs ADD COLUMN lease_epoch INTEGER NOT NULL DEFAULT 0;
                 UPDATE schema_version SET version = 2;",
            )?;
        }
        Some(_) => {}
    }

    Ok(())
}
