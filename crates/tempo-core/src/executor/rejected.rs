//! What to do with a batch the worker pool could not take.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::dispatcher::Dispatcher;
use crate::domain::LeaseBatch;

#[async_trait]
pub trait RejectedBatchHandler: Send + Sync {
    async fn batch_rejected(&self, batch: LeaseBatch, dispatcher: &Dispatcher);
}

/// Drop the batch and let its leases expire.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropRejectedBatches;

#[async_trait]
impl RejectedBatchHandler for DropRejectedBatches {
    async fn batch_rejected(&self, batch: LeaseBatch, dispatcher: &Dispatcher) {
        warn!(
            batch_id = %batch.id,
            batch_size = batch.len(),
            lock_expires_at = %batch.lock_expires_at,
            "dropping rejected batch; jobs are retried after lease expiry"
        );
        dispatcher.abandon(&batch);
    }
}

/// Re-submit after `delay`, up to `attempts` times, then drop.
#[derive(Debug, Clone, Copy)]
pub struct RetryRejectedBatches {
    pub delay: Duration,
    pub attempts: u32,
}

impl RetryRejectedBatches {
    pub fn new(delay: Duration, attempts: u32) -> Self {
        Self { delay, attempts }
    }
}

#[async_trait]
impl RejectedBatchHandler for RetryRejectedBatches {
    async fn batch_rejected(&self, batch: LeaseBatch, dispatcher: &Dispatcher) {
        let mut batch = batch;
        for attempt in 1..=self.attempts {
            tokio::time::sleep(self.delay).await;
            match dispatcher.try_submit(batch) {
                Ok(()) => {
                    debug!(attempt, "rejected batch accepted on retry");
                    return;
                }
                Err(again) => batch = again,
            }
        }
        DropRejectedBatches.batch_rejected(batch, dispatcher).await;
    }
}

/// Run the batch on the submitting task. Acquisition pauses meanwhile,
/// which throttles it to the pool's pace.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerRunsRejectedBatches;

#[async_trait]
impl RejectedBatchHandler for CallerRunsRejectedBatches {
    async fn batch_rejected(&self, batch: LeaseBatch, dispatcher: &Dispatcher) {
        debug!(batch_id = %batch.id, "running rejected batch on the acquisition task");
        dispatcher.run_inline(batch).await;
    }
}
