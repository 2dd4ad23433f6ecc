//! Lease batch: the unit the acquisition loop hands to the dispatcher.

use chrono::{DateTime, Utc};

use super::ids::{BatchId, JobId, LockOwner};

/// Ordered job ids leased together in one acquisition call.
///
/// Non-exclusive jobs usually travel alone; exclusive jobs of one resource
/// are grouped so a single worker runs them back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseBatch {
    pub id: BatchId,
    pub job_ids: Vec<JobId>,
    pub lock_owner: LockOwner,
    pub lock_expires_at: DateTime<Utc>,
}

impl LeaseBatch {
    pub fn new(
        id: BatchId,
        job_ids: Vec<JobId>,
        lock_owner: LockOwner,
        lock_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_ids,
            lock_owner,
            lock_expires_at,
        }
    }

    pub fn len(&self) -> usize {
        self.job_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }

    /// Same batch identity, different ids (used after filtering).
    pub fn with_job_ids(&self, job_ids: Vec<JobId>) -> Self {
        Self {
            id: self.id,
            job_ids,
            lock_owner: self.lock_owner.clone(),
            lock_expires_at: self.lock_expires_at,
        }
    }
}
