//! InMemoryJobStore - 開発・テスト用の job store
//!
//! # 実装詳細
//! - 全行を tokio `Mutex` 配下の 1 つの `HashMap` に持つ
//! - `acquire` の間ずっと lock を握ることで lease を atomic にする
//!   （DB なら `UPDATE ... WHERE lock_owner IS NULL OR lock_expires_at < now` に相当）
//! - lease 中の行の更新は `lock_owner` 一致が条件。不一致は `StoreError::Conflict`

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Job, JobFailure, JobId, JobState, LeaseBatch, LockOwner, NewJob, StoreError,
};
use crate::ports::{
    Clock, IdGenerator, JobCounts, JobStore, StoreWrite, SystemClock, UlidGenerator, to_delta,
};

pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            clock,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Insert a job outside any transaction (seeding, tests).
    pub async fn insert(&self, new_job: NewJob) -> JobId {
        let job = new_job.into_job(self.ids.generate_job_id(), self.clock.now());
        let id = job.id;
        self.jobs.lock().await.insert(id, job);
        id
    }

    /// Insert a fully built row as is.
    pub async fn insert_job(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// acquire 候補を取得順に返す（due が早い順、次に古い順）
    ///
    /// 同じ resource の exclusive job が有効な lease 中なら、どのインスタンスの
    /// lease であっても exclusive job は見送る。
    fn acquirable(jobs: &HashMap<JobId, Job>, now: DateTime<Utc>) -> Vec<(JobId, Option<String>)> {
        let busy: HashSet<&str> = jobs
            .values()
            .filter(|job| job.is_leased(now))
            .filter_map(Job::exclusive_key)
            .collect();

        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|job| job.is_acquirable(now))
            .filter(|job| job.exclusive_key().is_none_or(|key| !busy.contains(key)))
            .collect();
        candidates.sort_by_key(|job| (job.due_time, job.created_at, job.id));
        candidates
            .into_iter()
            .map(|job| (job.id, job.exclusive_key().map(str::to_owned)))
            .collect()
    }

    /// The row, if `owner` still holds its lease.
    fn owned<'a>(
        jobs: &'a mut HashMap<JobId, Job>,
        job_id: JobId,
        owner: &LockOwner,
    ) -> Result<&'a mut Job, StoreError> {
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.lock_owner.as_ref() != Some(owner) {
            return Err(StoreError::Conflict(job_id));
        }
        Ok(job)
    }

    fn validate(jobs: &HashMap<JobId, Job>, writes: &[StoreWrite]) -> Result<(), StoreError> {
        let mut inserted: HashMap<JobId, &Job> = HashMap::new();
        for write in writes {
            match write {
                StoreWrite::Insert(job) => {
                    if jobs.contains_key(&job.id) || inserted.insert(job.id, job).is_some() {
                        return Err(StoreError::Conflict(job.id));
                    }
                }
                StoreWrite::Delete { job_id, lock_owner }
                | StoreWrite::Reschedule {
                    job_id, lock_owner, ..
                } => {
                    let job = jobs
                        .get(job_id)
                        .or_else(|| inserted.get(job_id).copied())
                        .ok_or(StoreError::NotFound(*job_id))?;
                    if job.lock_owner.as_ref() != Some(lock_owner) {
                        return Err(StoreError::Conflict(*job_id));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn acquire(
        &self,
        max_jobs: usize,
        lease: Duration,
        owner: &LockOwner,
    ) -> Result<Vec<LeaseBatch>, StoreError> {
        let now = self.clock.now();
        let expires_at = now + to_delta(lease);
        let mut jobs = self.jobs.lock().await;

        let candidates = Self::acquirable(&jobs, now);
        let mut taken: HashSet<JobId> = HashSet::new();
        let mut batches = Vec::new();

        for (job_id, key) in &candidates {
            if batches.len() >= max_jobs {
                break;
            }
            if taken.contains(job_id) {
                continue;
            }

            // An exclusive job brings every other due exclusive job of its
            // resource along, so they land on one worker.
            let job_ids: Vec<JobId> = match key {
                Some(key) => candidates
                    .iter()
                    .filter(|(id, other)| other.as_deref() == Some(key.as_str()) && !taken.contains(id))
                    .map(|(id, _)| *id)
                    .collect(),
                None => vec![*job_id],
            };

            for id in &job_ids {
                taken.insert(*id);
                if let Some(job) = jobs.get_mut(id) {
                    job.lease(owner.clone(), expires_at);
                }
            }
            batches.push(LeaseBatch::new(
                self.ids.generate_batch_id(),
                job_ids,
                owner.clone(),
                expires_at,
            ));
        }

        Ok(batches)
    }

    async fn find(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        Self::validate(&jobs, &writes)?;

        for write in writes {
            match write {
                StoreWrite::Insert(job) => {
                    jobs.insert(job.id, job);
                }
                StoreWrite::Delete { job_id, .. } => {
                    jobs.remove(&job_id);
                }
                StoreWrite::Reschedule {
                    job_id,
                    due_time,
                    repeat,
                    ..
                } => {
                    if let Some(job) = jobs.get_mut(&job_id) {
                        job.due_time = due_time;
                        job.repeat = repeat;
                        job.release_lease();
                    }
                }
            }
        }
        Ok(())
    }

    async fn decrement_retries(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        failure: JobFailure,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::owned(&mut jobs, job_id, owner)?;
        job.retries_left = job.retries_left.saturating_sub(1);
        job.failures += 1;
        job.last_failure = Some(failure);
        Ok(job.clone())
    }

    async fn release_lease(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::owned(&mut jobs, job_id, owner)?;
        job.release_lease();
        if let Some(due_time) = due_time {
            job.due_time = due_time;
        }
        Ok(())
    }

    async fn mark_permanently_failed(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        failure: JobFailure,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = Self::owned(&mut jobs, job_id, owner)?;
        job.mark_failed(failure);
        Ok(())
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let now = self.clock.now();
        let jobs = self.jobs.lock().await;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            if job.state == JobState::Failed {
                counts.failed += 1;
            } else if job.is_leased(now) {
                counts.leased += 1;
            } else if job.is_acquirable(now) {
                counts.due += 1;
            } else {
                counts.waiting += 1;
            }
        }
        Ok(counts)
    }

    async fn failed_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut failed: Vec<Job> = jobs
            .values()
            .filter(|job| job.state == JobState::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|job| job.id);
        Ok(failed)
    }
}
