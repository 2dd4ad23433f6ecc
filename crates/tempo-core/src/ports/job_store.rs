//! JobStore port: the persistence layer that owns job rows.
//!
//! The store is the only state shared between scheduler instances, so it
//! is the only place where cross-instance correctness is decided:
//! - `acquire` leases due jobs with an atomic conditional update on
//!   `lock_owner`/`lock_expires_at`; a job lost to another instance is simply
//!   not returned
//! - every other mutation touches one row, or applies one transaction's
//!   staged writes as a unit (`commit`)
//! - mutations of a leased row are conditional on `lock_owner`; a caller
//!   whose lease was taken over gets `StoreError::Conflict` and the row is
//!   left alone

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobFailure, JobId, LeaseBatch, LockOwner, StoreError};

/// A write staged in a transaction, applied only on commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    /// New row. It may already carry a lease (exclusive follow-up jobs).
    Insert(Job),

    /// Finished job without repeat.
    Delete { job_id: JobId, lock_owner: LockOwner },

    /// Finished repeating job: new due time, next descriptor, lease cleared.
    Reschedule {
        job_id: JobId,
        lock_owner: LockOwner,
        due_time: DateTime<Utc>,
        repeat: Option<String>,
    },
}

/// Job counts by scheduling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Acquirable right now.
    pub due: usize,
    /// Active but due in the future.
    pub waiting: usize,
    /// Holding an unexpired lease.
    pub leased: usize,
    /// Retries exhausted.
    pub failed: usize,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Lease up to `max_jobs` due, unleased jobs to `owner` for `lease`.
    ///
    /// Returns the leased ids grouped into batches; an empty vec means
    /// nothing is due.
    async fn acquire(
        &self,
        max_jobs: usize,
        lease: Duration,
        owner: &LockOwner,
    ) -> Result<Vec<LeaseBatch>, StoreError>;

    async fn find(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Apply a transaction's staged writes atomically (all or none).
    /// `Delete` and `Reschedule` require the row to still be leased by their
    /// `lock_owner`.
    async fn commit(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError>;

    /// `retries_left -= 1`, `failures += 1`, record the failure. Returns the
    /// updated row. The lease is left as is.
    async fn decrement_retries(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        failure: JobFailure,
    ) -> Result<Job, StoreError>;

    /// Clear the lease; with `due_time`, also push the job into the future.
    async fn release_lease(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Terminal failure: keep the row with its failure, never acquire it again.
    async fn mark_permanently_failed(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        failure: JobFailure,
    ) -> Result<(), StoreError>;

    async fn counts(&self) -> Result<JobCounts, StoreError>;

    /// Permanently failed jobs, for operators.
    async fn failed_jobs(&self) -> Result<Vec<Job>, StoreError>;
}
