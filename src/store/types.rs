// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Datastore record types.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::sandbox::FileMap;

/// Persisted job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            other => Err(StoreError::Serialization(format!("unknown job status: {}", other))),
        }
    }
}

/// One generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    pub project_id: String,
    pub status: JobStatus,
    pub sandbox_ref: Option<String>,
    /// Run that currently owns the job.
    pub run_id: Option<String>,
    /// Bumped on every claim and takeover.
    pub lease_epoch: i64,
    pub lease_expires_at: Option<i64>,
    pub started_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    /// The lease currently recorded on the row, if any run owns it.
    pub fn lease(&self) -> Option<Lease> {
        self.run_id
            .as_ref()
            .map(|run_id| Lease::new(run_id.clone(), self.lease_epoch))
    }

    /// Whether the owning run's lease has lapsed at `now`.
    pub fn lease_expired(&self, now: i64) -> bool {
        self.lease_expires_at.map(|t| t < now).unwrap_or(true)
    }
}

/// A run's hold on a job.
///
/// A takeover keeps the run id so checkpoints replay, but bumps the epoch,
/// so the worker it replaced fails every later lease check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub run_id: String,
    pub epoch: i64,
}

impl Lease {
    pub fn new(run_id: impl Into<String>, epoch: i64) -> Self {
        Self {
            run_id: run_id.into(),
            epoch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Result,
    Error,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "USER" => Ok(Self::User),
            "ASSISTANT" => Ok(Self::Assistant),
            other => Err(StoreError::Serialization(format!("unknown message role: {}", other))),
        }
    }
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "RESULT",
            Self::Error => "ERROR",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "RESULT" => Ok(Self::Result),
            "ERROR" => Ok(Self::Error),
            other => Err(StoreError::Serialization(format!("unknown message kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub job_id: String,
    pub role: MessageRole,
    pub kind: MessageKind,
    pub content: String,
    pub created_at: i64,
}

/// Fragment contents supplied at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFragment {
    pub sandbox_url: String,
    pub title: String,
    pub files: FileMap,
}

/// The durable artifact of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: String,
    pub message_id: String,
    pub job_id: String,
    pub sandbox_url: String,
    pub title: String,
    pub files: FileMap,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outward view of a finished (or pending) job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    /// Last assistant message, empty while pending.
    pub final_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<Fragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [JobStatus::Pending, JobStatus::Completed, JobStatus::Error] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_text_enums() {
        assert_eq!(MessageKind::parse("ERROR").unwrap(), MessageKind::Error);
        assert_eq!(MessageRole::Assistant.as_str(), "ASSISTANT");
        assert!(MessageRole::parse("tool").is_err());
    }

    #[test]
    fn test_lease_expiry() {
        let mut job = Job {
            id: "j".to_string(),
            owner_id: "o".to_string(),
            project_id: "p".to_string(),
            status: JobStatus::Pending,
            sandbox_ref: None,
            run_id: None,
            lease_epoch: 0,
            lease_expires_at: None,
            started_at: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(job.lease().is_none());
        assert!(job.lease_expired(10));
        job.lease_expires_at = Some(100);
        assert!(!job.lease_expired(50));
        assert!(job.lease_expired(101));

        job.run_id = Some("run".to_string());
        job.lease_epoch = 2;
        assert_eq!(job.lease(), Some(Lease::new("run", 2)));
    }

    #[test]
    fn test_record_wire_shape() {
        let record = JobRecord {
            job_id: "j".to_string(),
            status: JobStatus::Completed,
            final_message: "Done".to_string(),
            fragment: None,
            generation_seconds: Some(1.5),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["finalMessage"], "Done");
        assert_eq!(json["generationSeconds"], 1.5);
        assert!(json.get("fragment").is_none());
    }
}
