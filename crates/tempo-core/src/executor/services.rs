//! Collaborators shared by everything that creates or finishes jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::context::CurrentJob;
use super::notify::{ExclusiveJobAddedNotification, JobAddedNotification};
use super::wake::WakeSignal;
use crate::domain::{Job, JobId, LockOwner, NewJob};
use crate::ports::{Clock, IdGenerator, Recurrence, StoreWrite, to_delta};
use crate::tx::Transaction;

#[derive(Clone)]
pub struct JobServices {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub recurrence: Arc<dyn Recurrence>,
    pub wake: WakeSignal,
    pub lock_owner: LockOwner,
    pub lock_time: Duration,
}

impl JobServices {
    /// Stage a new job on `tx` and register the matching commit notifier.
    ///
    /// When `current` is an exclusive job of the same resource and the new
    /// job is due, the row is inserted already leased to this instance and
    /// its id goes to `sink`; otherwise acquisition is woken after commit.
    pub fn stage_new_job(
        &self,
        tx: &mut Transaction,
        new_job: NewJob,
        local: Option<(&CurrentJob, &mpsc::UnboundedSender<JobId>)>,
    ) -> JobId {
        let now = self.clock.now();
        let mut job: Job = new_job.into_job(self.ids.generate_job_id(), now);
        let job_id = job.id;

        match local {
            Some((current, sink)) if current.keeps_locally(&job, now) => {
                job.lease(self.lock_owner.clone(), now + to_delta(self.lock_time));
                tx.stage(StoreWrite::Insert(job));
                tx.on_commit(ExclusiveJobAddedNotification::new(job_id, sink.clone()));
            }
            _ => {
                tx.stage(StoreWrite::Insert(job));
                tx.on_commit(JobAddedNotification::new(self.wake.clone()));
            }
        }
        job_id
    }
}
