//! JobRunner: executes the jobs of one lease batch on one worker.
//!
//! Flow per job:
//! 1. re-load the row and check the lease is still ours
//! 2. open a transaction with the failure listener registered on rollback
//! 3. run the handler, then stage completion (delete or reschedule)
//! 4. commit, or roll back on error
//!
//! Exclusive jobs created by the handler for its own resource come back
//! through the execution context and run on this worker after the batch.
//!
//! The in-flight claim on a job is held by a guard, so a worker aborted at
//! shutdown still gives the id back to acquisition.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info_span, instrument, warn};

use super::acquired::InFlightJobs;
use super::context::{CurrentJob, ExecutionContext};
use super::failure::{FailedJobCommandFactory, FailedJobListener};
use super::notify::JobAddedNotification;
use super::pool::BatchExecutor;
use super::services::JobServices;
use crate::domain::{Job, JobError, JobId, LeaseBatch, StoreError};
use crate::handler::{HandlerRegistry, JobContext};
use crate::observability::SchedulerStats;
use crate::ports::{JobStore, StoreWrite};
use crate::tx::{CommandExecutor, Transaction};

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    commands: CommandExecutor,
    registry: Arc<HandlerRegistry>,
    services: Arc<JobServices>,
    failures: Arc<dyn FailedJobCommandFactory>,
    in_flight: Arc<InFlightJobs>,
    stats: Arc<SchedulerStats>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        services: Arc<JobServices>,
        failures: Arc<dyn FailedJobCommandFactory>,
        in_flight: Arc<InFlightJobs>,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            commands: CommandExecutor::new(Arc::clone(&store)),
            store,
            registry,
            services,
            failures,
            in_flight,
            stats,
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn execute_job(&self, job_id: JobId, ctx: &mut ExecutionContext) {
        let claim = InFlightClaim {
            in_flight: &self.in_flight,
            job_id,
        };
        let Some(job) = self.load_leased(job_id).await else {
            return;
        };

        ctx.enter(&job);
        let mut tx = Transaction::new();
        tx.on_rollback(FailedJobListener::new(
            job.id,
            self.services.lock_owner.clone(),
            self.commands.clone(),
            Arc::clone(&self.failures),
            Arc::clone(&self.services.clock),
        ));

        let current = ctx.current().cloned();
        let result = self
            .run_handler(&job, &mut tx, current, ctx.exclusive_sink())
            .await;
        ctx.exit();

        // A retry released by the failure listener may be leased again by the
        // next round; the claim has to be gone by then.
        drop(claim);

        match result {
            Ok(()) => match tx.commit(self.store.as_ref()).await {
                Ok(()) => {
                    self.stats.record_succeeded();
                    debug!(handler_type = %job.handler_type, "job completed");
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(handler_type = %job.handler_type, "lease taken over before commit; result discarded");
                }
                Err(err) => {
                    self.stats.record_failed();
                    warn!(error = %err, "job completed but its transaction failed to commit");
                }
            },
            Err(err) => {
                self.stats.record_failed();
                warn!(handler_type = %job.handler_type, error = %err, "job failed");
                tx.rollback(err.to_string()).await;
            }
        }
    }

    /// The job as stored, if it still exists and we still hold its lease.
    async fn load_leased(&self, job_id: JobId) -> Option<Job> {
        let job = match self.store.find(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("job no longer exists; skipping");
                return None;
            }
            Err(err) => {
                warn!(error = %err, "failed to load job; leaving it for lease expiry");
                return None;
            }
        };

        let now = self.services.clock.now();
        if !job.is_leased_by(&self.services.lock_owner, now) {
            warn!(
                owner = ?job.lock_owner,
                lock_expires_at = ?job.lock_expires_at,
                "lease lost before execution; skipping"
            );
            return None;
        }
        Some(job)
    }

    async fn run_handler(
        &self,
        job: &Job,
        tx: &mut Transaction,
        current: Option<CurrentJob>,
        sink: mpsc::UnboundedSender<JobId>,
    ) -> Result<(), JobError> {
        let handler = self
            .registry
            .get(&job.handler_type)
            .ok_or_else(|| JobError::HandlerNotFound(job.handler_type.clone()))?;

        let mut job_ctx = JobContext::new(job, tx, current, sink, &self.services);
        handler.execute(&mut job_ctx).await?;

        self.stage_completion(job, tx)
    }

    /// Delete a finished job, or move a repeating one to its next due time.
    fn stage_completion(&self, job: &Job, tx: &mut Transaction) -> Result<(), JobError> {
        let next = match job.repeat.as_deref() {
            Some(repeat) => self
                .services
                .recurrence
                .next(repeat, self.services.clock.now())?,
            None => None,
        };

        match next {
            Some(next) => {
                tx.stage(StoreWrite::Reschedule {
                    job_id: job.id,
                    lock_owner: self.services.lock_owner.clone(),
                    due_time: next.due_time,
                    repeat: next.repeat,
                });
                tx.on_commit(JobAddedNotification::new(self.services.wake.clone()));
            }
            None => {
                tx.stage(StoreWrite::Delete {
                    job_id: job.id,
                    lock_owner: self.services.lock_owner.clone(),
                });
                // jobs of this resource held back by acquisition are free now
                if job.exclusive_key().is_some() {
                    tx.on_commit(JobAddedNotification::new(self.services.wake.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Gives a job's in-flight claim back when dropped, including when the
/// worker running it is aborted.
struct InFlightClaim<'a> {
    in_flight: &'a InFlightJobs,
    job_id: JobId,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.release(self.job_id);
    }
}

#[async_trait]
impl BatchExecutor for JobRunner {
    async fn execute_batch(&self, batch: LeaseBatch) {
        let span = info_span!("batch", batch_id = %batch.id, batch_size = batch.len());
        async {
            let mut ctx = ExecutionContext::for_batch(&batch, Arc::clone(&self.in_flight));
            while let Some(job_id) = ctx.next_job() {
                self.execute_job(job_id, &mut ctx).await;
            }
        }
        .instrument(span)
        .await;
    }
}
