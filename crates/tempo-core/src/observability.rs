use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ports::JobCounts;

/// Counters maintained by a running scheduler.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    acquisition_cycles: AtomicU64,
    acquisition_errors: AtomicU64,
    jobs_acquired: AtomicU64,
    batches_rejected: AtomicU64,
    jobs_executed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self) {
        self.acquisition_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition_error(&self) {
        self.acquisition_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquired(&self, jobs: usize) {
        self.jobs_acquired
            .fetch_add(u64::try_from(jobs).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, jobs: JobCounts) -> StatsSnapshot {
        StatsSnapshot {
            acquisition_cycles: self.acquisition_cycles.load(Ordering::Relaxed),
            acquisition_errors: self.acquisition_errors.load(Ordering::Relaxed),
            jobs_acquired: self.jobs_acquired.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub acquisition_cycles: u64,
    pub acquisition_errors: u64,
    pub jobs_acquired: u64,
    pub batches_rejected: u64,
    pub jobs_executed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs: JobCounts,
}
