//! Commit-phase notifiers.
//!
//! Both are registered with `Transaction::on_commit` and ignore any other
//! outcome.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::wake::WakeSignal;
use crate::domain::JobId;
use crate::tx::{TransactionListener, TransactionOutcome};

/// Wakes the acquisition loop once a new or rescheduled job is committed.
#[derive(Debug, Clone)]
pub struct JobAddedNotification {
    wake: WakeSignal,
}

impl JobAddedNotification {
    pub fn new(wake: WakeSignal) -> Self {
        Self { wake }
    }
}

#[async_trait]
impl TransactionListener for JobAddedNotification {
    async fn notify(self: Box<Self>, outcome: &TransactionOutcome) {
        if *outcome == TransactionOutcome::Committed {
            self.wake.notify();
        }
    }
}

/// Hands a committed exclusive job to the worker that created it.
#[derive(Debug)]
pub struct ExclusiveJobAddedNotification {
    job_id: JobId,
    sink: mpsc::UnboundedSender<JobId>,
}

impl ExclusiveJobAddedNotification {
    pub fn new(job_id: JobId, sink: mpsc::UnboundedSender<JobId>) -> Self {
        Self { job_id, sink }
    }
}

#[async_trait]
impl TransactionListener for ExclusiveJobAddedNotification {
    async fn notify(self: Box<Self>, outcome: &TransactionOutcome) {
        if *outcome != TransactionOutcome::Committed {
            return;
        }
        // The receiver is gone only if the worker's context was dropped;
        // the job is pre-leased and comes back after lease expiry.
        if self.sink.send(self.job_id).is_err() {
            debug!(job_id = %self.job_id, "execution context closed before exclusive job could be queued");
        }
    }
}
