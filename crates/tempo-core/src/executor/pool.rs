//! WorkerPool - lease batch 用の上限付きワーカープール
//!
//! 投入は決してブロックしない。batch の行き先（優先順）:
//! 1. 稼働ワーカーが `core_pool_size` 未満なら新しいワーカー
//! 2. キューが `queue_size` 未満ならキュー
//! 3. 稼働ワーカーが `max_pool_size` 未満なら新しいワーカー
//!
//! どれにも入らなければ rejected として呼び出し元に返す。
//! core を超えたワーカーは `keep_alive` の間仕事がなければ終了する。

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::config::SchedulerConfig;
use crate::domain::LeaseBatch;

/// lease batch を 1 つ最後まで実行する
#[async_trait]
pub trait BatchExecutor: Send + Sync + 'static {
    async fn execute_batch(&self, batch: LeaseBatch);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub queue_size: usize,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub keep_alive: Duration,
}

impl From<&SchedulerConfig> for PoolSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            queue_size: config.queue_size,
            core_pool_size: config.core_pool_size,
            max_pool_size: config.max_pool_size,
            keep_alive: config.keep_alive(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<LeaseBatch>,
    workers: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Notify,
    executor: Arc<dyn BatchExecutor>,
    settings: PoolSettings,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, executor: Arc<dyn BatchExecutor>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                work_ready: Notify::new(),
                executor,
                settings,
            }),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Hand `batch` to the pool, or give it back if the pool is saturated or
    /// shut down.
    pub fn try_submit(&self, batch: LeaseBatch) -> Result<(), LeaseBatch> {
        let settings = self.shared.settings;
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(batch);
        }

        if state.workers < settings.core_pool_size {
            state.workers += 1;
            drop(state);
            self.spawn_worker(batch);
            return Ok(());
        }

        if state.queue.len() < settings.queue_size {
            state.queue.push_back(batch);
            drop(state);
            self.shared.work_ready.notify_one();
            return Ok(());
        }

        if state.workers < settings.max_pool_size {
            state.workers += 1;
            drop(state);
            self.spawn_worker(batch);
            return Ok(());
        }

        Err(batch)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.lock().workers
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Stop accepting work, let workers finish what is queued, and wait up
    /// to `grace` for them. Workers still busy after that are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.lock().shutdown = true;
        self.shared.work_ready.notify_waiters();

        let mut workers = std::mem::take(&mut *self.lock_workers());
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = workers.join_next().await {
                log_worker_exit(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                workers = workers.len(),
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "workers did not finish within the shutdown grace period; aborting"
            );
            workers.shutdown().await;
        }
    }

    fn spawn_worker(&self, first: LeaseBatch) {
        let shared = Arc::clone(&self.shared);
        let mut workers = self.lock_workers();
        while let Some(result) = workers.try_join_next() {
            log_worker_exit(result);
        }
        workers.spawn(run_worker(shared, first));
    }

    fn lock_workers(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_worker_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result
        && err.is_panic()
    {
        error!(error = %err, "worker panicked");
    }
}

/// タスクが自分で slot を返さずに終わった場合（panic / abort）に slot を返す
struct WorkerSlot {
    shared: Arc<PoolShared>,
    held: bool,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.held {
            self.shared.lock().workers -= 1;
        }
    }
}

async fn run_worker(shared: Arc<PoolShared>, first: LeaseBatch) {
    let mut slot = WorkerSlot {
        shared: Arc::clone(&shared),
        held: true,
    };
    let mut next = Some(first);

    loop {
        if let Some(batch) = next.take() {
            shared.executor.execute_batch(batch).await;
        }

        let mut notified = pin!(shared.work_ready.notified());
        notified.as_mut().enable();

        let extra = {
            let mut state = shared.lock();
            if let Some(batch) = state.queue.pop_front() {
                next = Some(batch);
                continue;
            }
            if state.shutdown {
                state.workers -= 1;
                slot.held = false;
                return;
            }
            state.workers > shared.settings.core_pool_size
        };

        if !extra {
            notified.await;
            continue;
        }

        if tokio::time::timeout(shared.settings.keep_alive, notified)
            .await
            .is_err()
        {
            let mut state = shared.lock();
            if state.queue.is_empty() && state.workers > shared.settings.core_pool_size {
                state.workers -= 1;
                slot.held = false;
                debug!(workers = state.workers, "idle worker exited");
                return;
            }
        }
    }
}
