//! Dispatcher: the acquisition loop's only way into the worker pool.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::acquired::InFlightJobs;
use super::pool::{BatchExecutor, PoolSettings, WorkerPool};
use super::rejected::RejectedBatchHandler;
use crate::domain::LeaseBatch;
use crate::observability::SchedulerStats;

pub struct Dispatcher {
    pool: WorkerPool,
    executor: Arc<dyn BatchExecutor>,
    rejected: Arc<dyn RejectedBatchHandler>,
    in_flight: Arc<InFlightJobs>,
    stats: Arc<SchedulerStats>,
}

impl Dispatcher {
    pub fn new(
        settings: PoolSettings,
        executor: Arc<dyn BatchExecutor>,
        rejected: Arc<dyn RejectedBatchHandler>,
        in_flight: Arc<InFlightJobs>,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            pool: WorkerPool::new(settings, Arc::clone(&executor)),
            executor,
            rejected,
            in_flight,
            stats,
        }
    }

    /// Submit a batch; a saturated pool hands it to the rejected-batch
    /// handler.
    pub async fn dispatch(&self, batch: LeaseBatch) {
        if let Err(batch) = self.pool.try_submit(batch) {
            self.stats.record_rejected();
            warn!(
                batch_id = %batch.id,
                batch_size = batch.len(),
                "worker pool saturated; batch rejected"
            );
            self.rejected.batch_rejected(batch, self).await;
        }
    }

    /// One more attempt at the pool, without the rejection path.
    pub fn try_submit(&self, batch: LeaseBatch) -> Result<(), LeaseBatch> {
        self.pool.try_submit(batch)
    }

    /// Execute the batch on the calling task.
    pub async fn run_inline(&self, batch: LeaseBatch) {
        self.executor.execute_batch(batch).await;
    }

    /// Give up on a batch. Its jobs stay leased in the store until the lease
    /// expires; after that any acquisition round may take them again.
    pub fn abandon(&self, batch: &LeaseBatch) {
        self.in_flight.release_all(&batch.job_ids);
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}
