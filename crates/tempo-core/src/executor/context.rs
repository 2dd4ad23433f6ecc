//! ExecutionContext - 1 ワーカーが今実行しているもの
//!
//! context は 1 ワーカー上の 1 batch の間だけ生き、共有されない。
//! 保持するもの:
//! - batch の残りの id
//! - 実行中の job
//! - その job が自分の resource に作った exclusive job の専用キュー
//!
//! キューへの投入者は commit listener で、sender しか持たないため
//! unbounded channel 経由で積む。

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::acquired::InFlightJobs;
use crate::domain::{Job, JobId, LeaseBatch};

/// ワーカーが実行中の job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentJob {
    pub job_id: JobId,
    pub exclusive: bool,
    pub resource_key: Option<String>,
}

impl CurrentJob {
    pub fn of(job: &Job) -> Self {
        Self {
            job_id: job.id,
            exclusive: job.exclusive,
            resource_key: job.resource_key.clone(),
        }
    }

    /// Whether a job created while this one runs stays on this worker.
    ///
    /// Both must be exclusive on the same resource, and the new job must be
    /// due now; a future job is left to normal acquisition.
    pub fn keeps_locally(&self, new_job: &Job, now: DateTime<Utc>) -> bool {
        self.exclusive
            && new_job.exclusive
            && self.resource_key.is_some()
            && new_job.resource_key == self.resource_key
            && new_job.is_due(now)
    }
}

#[derive(Debug)]
pub struct ExecutionContext {
    batch: VecDeque<JobId>,
    exclusive: VecDeque<JobId>,
    current: Option<CurrentJob>,
    sink: mpsc::UnboundedSender<JobId>,
    discovered: mpsc::UnboundedReceiver<JobId>,
    in_flight: Arc<InFlightJobs>,
}

impl ExecutionContext {
    pub fn for_batch(batch: &LeaseBatch, in_flight: Arc<InFlightJobs>) -> Self {
        let (sink, discovered) = mpsc::unbounded_channel();
        Self {
            batch: batch.job_ids.iter().copied().collect(),
            exclusive: VecDeque::new(),
            current: None,
            sink,
            discovered,
            in_flight,
        }
    }

    /// Next job to run: the rest of the batch, then the exclusive jobs
    /// discovered along the way, in creation order.
    pub fn next_job(&mut self) -> Option<JobId> {
        while let Ok(job_id) = self.discovered.try_recv() {
            self.exclusive.push_back(job_id);
        }
        self.batch.pop_front().or_else(|| self.exclusive.pop_front())
    }

    pub fn enter(&mut self, job: &Job) {
        self.current = Some(CurrentJob::of(job));
    }

    pub fn exit(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&CurrentJob> {
        self.current.as_ref()
    }

    /// Sender feeding this context's exclusive queue.
    pub fn exclusive_sink(&self) -> mpsc::UnboundedSender<JobId> {
        self.sink.clone()
    }
}

impl Drop for ExecutionContext {
    /// Ids that never ran (the worker was aborted) go back to acquisition.
    fn drop(&mut self) {
        let remaining: Vec<JobId> = self.batch.drain(..).collect();
        self.in_flight.release_all(&remaining);
    }
}
