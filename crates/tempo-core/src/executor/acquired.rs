//! acquire した job id の管理
//!
//! - `AcquiredJobs`: 1 ラウンド分の batch と重複排除用の index
//! - `InFlightJobs`: ワーカーに渡してまだ終わっていない id（ラウンドをまたぐ）

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::domain::{JobId, LeaseBatch};

/// 1 ラウンドの acquire 結果
#[derive(Debug, Default)]
pub struct AcquiredJobs {
    batches: Vec<LeaseBatch>,
    index: HashSet<JobId>,
}

impl AcquiredJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch, dropping ids this round already holds.
    ///
    /// Returns `false` when nothing new was left in the batch.
    pub fn add_batch(&mut self, batch: LeaseBatch) -> bool {
        let fresh: Vec<JobId> = batch
            .job_ids
            .iter()
            .copied()
            .filter(|id| self.index.insert(*id))
            .collect();
        if fresh.is_empty() {
            return false;
        }
        self.batches.push(batch.with_job_ids(fresh));
        true
    }

    /// Number of distinct job ids.
    pub fn size(&self) -> usize {
        self.index.len()
    }

    pub fn into_batches(self) -> Vec<LeaseBatch> {
        self.batches
    }
}

/// このインスタンスのワーカーが今持っている job id
///
/// 実行中に lease が切れた job は同じインスタンスに再度 lease されうる。
/// ここでの claim が二重 dispatch を防ぐ。
#[derive(Debug, Default)]
pub struct InFlightJobs {
    ids: Mutex<HashSet<JobId>>,
}

impl InFlightJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` if the id is already in flight.
    pub fn claim(&self, job_id: JobId) -> bool {
        self.lock().insert(job_id)
    }

    pub fn release(&self, job_id: JobId) {
        self.lock().remove(&job_id);
    }

    pub fn release_all(&self, job_ids: &[JobId]) {
        let mut ids = self.lock();
        for job_id in job_ids {
            ids.remove(job_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, job_id: JobId) -> bool {
        self.lock().contains(&job_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
