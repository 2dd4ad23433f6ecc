//! Failure pipeline.
//!
//! A failed job's transaction rolls back; `FailedJobListener` then runs the
//! command built by a `FailedJobCommandFactory` in a fresh transaction, so
//! the bookkeeping survives the rollback of the work itself.
//!
//! Every store update is conditional on the failing instance still holding
//! the lease. If the lease expired and another instance took the job over,
//! the failure is not recorded; the new owner's run decides the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::notify::JobAddedNotification;
use super::wake::WakeSignal;
use crate::domain::{JobFailure, JobId, LockOwner, RetryPolicy, SchedulerError, StoreError};
use crate::ports::{Clock, JobStore, to_delta};
use crate::tx::{Command, CommandExecutor, Transaction, TransactionListener, TransactionOutcome};

/// Builds the command that records a job failure.
///
/// Replace the default to add dead-lettering or alerting.
pub trait FailedJobCommandFactory: Send + Sync {
    fn create(&self, job_id: JobId, lock_owner: LockOwner, failure: JobFailure) -> Box<dyn Command>;
}

pub struct DefaultFailedJobCommandFactory {
    retry_policy: RetryPolicy,
    wake: WakeSignal,
    clock: Arc<dyn Clock>,
}

impl DefaultFailedJobCommandFactory {
    pub fn new(retry_policy: RetryPolicy, wake: WakeSignal, clock: Arc<dyn Clock>) -> Self {
        Self {
            retry_policy,
            wake,
            clock,
        }
    }
}

impl FailedJobCommandFactory for DefaultFailedJobCommandFactory {
    fn create(&self, job_id: JobId, lock_owner: LockOwner, failure: JobFailure) -> Box<dyn Command> {
        Box::new(DecrementJobRetries {
            job_id,
            lock_owner,
            failure,
            retry_policy: self.retry_policy.clone(),
            wake: self.wake.clone(),
            clock: Arc::clone(&self.clock),
        })
    }
}

/// Spend one retry; release the job for another attempt, or fail it for
/// good once no retries are left.
pub struct DecrementJobRetries {
    job_id: JobId,
    lock_owner: LockOwner,
    failure: JobFailure,
    retry_policy: RetryPolicy,
    wake: WakeSignal,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl Command for DecrementJobRetries {
    async fn execute(
        self: Box<Self>,
        tx: &mut Transaction,
        store: &dyn JobStore,
    ) -> Result<(), SchedulerError> {
        let job = store
            .decrement_retries(self.job_id, &self.lock_owner, self.failure.clone())
            .await?;

        if job.retries_left == 0 {
            store
                .mark_permanently_failed(self.job_id, &self.lock_owner, self.failure.clone())
                .await?;
            warn!(
                job_id = %self.job_id,
                failures = job.failures,
                error = %self.failure.message,
                "job failed permanently: no retries left"
            );
            return Ok(());
        }

        let delay = self.retry_policy.next_delay(job.failures);
        let due_time = (!delay.is_zero()).then(|| self.clock.now() + to_delta(delay));
        store
            .release_lease(self.job_id, &self.lock_owner, due_time)
            .await?;
        tx.on_commit(JobAddedNotification::new(self.wake.clone()));

        debug!(
            job_id = %self.job_id,
            retries_left = job.retries_left,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "job failed; retry scheduled"
        );
        Ok(())
    }
}

/// Registered on a job's transaction; acts only on rollback.
pub struct FailedJobListener {
    job_id: JobId,
    lock_owner: LockOwner,
    commands: CommandExecutor,
    factory: Arc<dyn FailedJobCommandFactory>,
    clock: Arc<dyn Clock>,
}

impl FailedJobListener {
    pub fn new(
        job_id: JobId,
        lock_owner: LockOwner,
        commands: CommandExecutor,
        factory: Arc<dyn FailedJobCommandFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            job_id,
            lock_owner,
            commands,
            factory,
            clock,
        }
    }
}

#[async_trait]
impl TransactionListener for FailedJobListener {
    async fn notify(self: Box<Self>, outcome: &TransactionOutcome) {
        let TransactionOutcome::RolledBack { reason } = outcome else {
            return;
        };
        let failure = JobFailure::new(reason.clone(), self.clock.now());
        let command = self.factory.create(self.job_id, self.lock_owner.clone(), failure);
        match self.commands.execute(command).await {
            Ok(()) => {}
            Err(SchedulerError::Store(StoreError::Conflict(_))) => {
                debug!(job_id = %self.job_id, "lease taken over; failure not recorded");
            }
            Err(err) => {
                // The lease is still ours; the job comes back after it expires.
                error!(job_id = %self.job_id, error = %err, "failed to record job failure");
            }
        }
    }
}
