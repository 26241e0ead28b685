// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Idempotency guard: decides whether a trigger may drive a job.
//!
//! Ownership is a lease on the job row. A fresh job is claimed, an `ERROR`
//! job is reset and claimed by a new run, and a `PENDING` job whose owner
//! stopped renewing is taken over under the *original* run id so its step
//! checkpoints replay. Every grant bumps the lease epoch, so a worker that
//! was taken over fails its next renewal even though the run id matches.
//! Anything else is skipped.

use std::time::Duration;

use serde::{Deserialize, Serialize};
#[cfg(feature = "telemetry")]
use tracing::debug;

#[cfg(feature = "telemetry")]
use crate::telemetry::GLOBAL_METRICS;

use crate::error::StoreError;
use crate::store::{now_millis, JobStatus, Lease, Store};

/// Bounded retries when a concurrent writer changes the row between read and CAS.
const MAX_CLAIM_ROUNDS: usize = 3;

/// Verdict for one trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Authorization {
    /// Run the job under `lease`. `resumed` means earlier checkpoints may exist.
    Proceed { lease: Lease, resumed: bool },
    SkipAlreadyRunning,
    SkipAlreadyDone,
}

impl Authorization {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::Proceed { lease, .. } => Some(lease.run_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct JobGuard {
    store: Store,
    lease_ttl: Duration,
}

impl JobGuard {
    pub fn new(store: Store, lease_ttl: Duration) -> Self {
        Self { store, lease_ttl }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    fn lease_until(&self) -> i64 {
        now_millis() + self.lease_ttl.as_millis() as i64
    }

    /// Decide whether `run_id` may drive `job_id`.
    pub fn authorize(&self, job_id: &str, run_id: &str) -> Result<Authorization, StoreError> {
        for _ in 0..MAX_CLAIM_ROUNDS {
            let job = self.store.get_job(job_id)?;
            let decision = match (job.status, job.run_id.as_deref()) {
                (JobStatus::Completed, _) => Some(Authorization::SkipAlreadyDone),
                (JobStatus::Error, _) => self
                    .store
                    .reset_and_claim(job_id, run_id, self.lease_until())?
                    .map(|lease| Authorization::Proceed { lease, resumed: false }),
                (JobStatus::Pending, None) => self
                    .store
                    .claim(job_id, run_id, self.lease_until())?
                    .map(|lease| Authorization::Proceed { lease, resumed: false }),
                (JobStatus::Pending, Some(owner)) if job.lease_expired(now_millis()) => self
                    .store
                    .take_over(job_id, owner, self.lease_until())?
                    .map(|lease| Authorization::Proceed { lease, resumed: true }),
                (JobStatus::Pending, Some(_)) => Some(Authorization::SkipAlreadyRunning),
            };

            if let Some(decision) = decision {
                #[cfg(feature = "telemetry")]
                {
                    debug!(job_id, ?decision, "Guard decision");
                    GLOBAL_METRICS.increment(match &decision {
                        Authorization::Proceed { resumed: true, .. } => "guard.resumed",
                        Authorization::Proceed { .. } => "guard.claimed",
                        Authorization::SkipAlreadyRunning => "guard.skip_running",
                        Authorization::SkipAlreadyDone => "guard.skip_done",
                    });
                }
                return Ok(decision);
            }
        }

        // Lost every race: someone else keeps winning the row.
        Ok(Authorization::SkipAlreadyRunning)
    }

    /// Extend the lease; `false` means the run no longer owns the job.
    pub fn renew(&self, job_id: &str, lease: &Lease) -> Result<bool, StoreError> {
        self.store.renew_lease(job_id, lease, self.lease_until())
    }

    pub fn release(&self, job_id: &str, lease: &Lease) -> Result<bool, StoreError> {
        self.store.release_lease(job_id, lease)
    }

    /// Bind a sandbox to the job. Returns the sandbox that ends up bound,
    /// which differs from `sandbox_ref` if another one got there first.
    pub fn bind_sandbox(&self, job_id: &str, lease: &Lease, sandbox_ref: &str) -> Result<Option<String>, StoreError> {
        if self.store.bind_sandbox(job_id, lease, sandbox_ref)? {
            return Ok(Some(sandbox_ref.to_string()));
        }
        Ok(self.store.get_job(job_id)?.sandbox_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SuccessRecord;

    fn guard() -> (Store, JobGuard) {
        let store = Store::open_in_memory().unwrap();
        let guard = JobGuard::new(store.clone(), Duration::from_secs(60));
        (store, guard)
    }

    fn lease_of(auth: Authorization) -> Lease {
        match auth {
            Authorization::Proceed { lease, .. } => lease,
            other => panic!("expected proceed, got {:?}", other),
        }
    }

    #[test]
    fn test_first_trigger_claims() {
        let (store, guard) = guard();
        let job = store.create_job("o", "p", "x").unwrap();

        let auth = guard.authorize(&job.id, "run-1").unwrap();
        assert_eq!(
            auth,
            Authorization::Proceed {
                lease: Lease::new("run-1", 1),
                resumed: false
            }
        );
        assert_eq!(auth.run_id(), Some("run-1"));
    }

    #[test]
    fn test_duplicate_trigger_skips() {
        let (store, guard) = guard();
        let job = store.create_job("o", "p", "x").unwrap();

        guard.authorize(&job.id, "run-1").unwrap();
        assert_eq!(guard.authorize(&job.id, "run-2").unwrap(), Authorization::SkipAlreadyRunning);
    }

    #[test]
    fn test_completed_job_is_done() {
        let (store, guard) = guard();
        let job = store.create_job("o", "p", "x").unwrap();
        let lease = lease_of(guard.authorize(&job.id, "run-1").unwrap());
        store
            .commit_success(
                &job.id,
                &lease,
                &SuccessRecord {
                    message: "ok".to_string(),
                    fragment: None,
                },
            )
            .unwrap();

        assert_eq!(guard.authorize(&job.id, "run-2").unwrap(), Authorization::SkipAlreadyDone);
    }

    #[test]
    fn test_error_job_restarts_fresh() {
        let (store, guard) = guard();
        let job = store.create_job("o", "p", "x").unwrap();
        let lease = lease_of(guard.authorize(&job.id, "run-1").unwrap());
        guard.bind_sandbox(&job.id, &lease, "sbx-1").unwrap();
        store.commit_failure(&job.id, &lease).unwrap();

        assert_eq!(
            guard.authorize(&job.id, "run-2").unwrap(),
            Authorization::Proceed {
                lease: Lease::new("run-2", 2),
                resumed: false
            }
        );
        let job = store.get_job(&job.id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.sandbox_ref.is_none());
    }

    #[test]
    fn test_expired_lease_resumes_original_run() {
        let (store, guard) = guard();
        let job = store.create_job("o", "p", "x").unwrap();
        let lease = lease_of(guard.authorize(&job.id, "run-1").unwrap());
        guard.release(&job.id, &lease).unwrap();

        assert_eq!(
            guard.authorize(&job.id, "run-2").unwrap(),
            Authorization::Proceed {
                lease: Lease::new("run-1", 2),
                resumed: true
            }
        );
        // The resumed run holds a fresh lease again.
        assert_eq!(guard.authorize(&job.id, "run-3").unwrap(), Authorization::SkipAlreadyRunning);
    }

    #[tokio::test]
    async fn test_slow_worker_loses_job_after_takeover() {
        let store = Store::open_in_memory().unwrap();
        let guard = JobGuard::new(store.clone(), Duration::from_millis(50));
        let job = store.create_job("o", "p", "x").unwrap();

        let slow = lease_of(guard.authorize(&job.id, "run-A").unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let auth = guard.authorize(&job.id, "run-B").unwrap();
        assert_eq!(auth.run_id(), Some("run-A"));
        let fresh = lease_of(auth);
        assert_ne!(fresh, slow);

        // The original worker is still alive but no longer owns the job.
        assert!(!guard.renew(&job.id, &slow).unwrap());
        assert!(guard.bind_sandbox(&job.id, &slow, "sbx-slow").unwrap().is_none());
        assert_eq!(
            store.commit_failure(&job.id, &slow).unwrap(),
            crate::store::CommitOutcome::NotOwner
        );
        assert!(guard.renew(&job.id, &fresh).unwrap());
    }

    #[test]
    fn test_bind_sandbox_reports_winner() {
        let (store, guard) = guard();
        let job = store.create_job("o", "p", "x").unwrap();
        let lease = lease_of(guard.authorize(&job.id, "run-1").unwrap());

        assert_eq!(guard.bind_sandbox(&job.id, &lease, "sbx-a").unwrap().as_deref(), Some("sbx-a"));
        assert_eq!(guard.bind_sandbox(&job.id, &lease, "sbx-b").unwrap().as_deref(), Some("sbx-a"));
    }

    #[test]
    fn test_unknown_job() {
        let (_store, guard) = guard();
        assert!(matches!(guard.authorize("missing", "r"), Err(StoreError::JobNotFound(_))));
    }
}
