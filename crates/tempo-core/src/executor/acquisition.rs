//! AcquisitionLoop - due な job を lease して dispatcher に渡すループ
//!
//! # 状態遷移
//! `Running` -> `Stopping`（停止要求）-> `Stopped`（ループ終了）
//!
//! 停止フラグは毎サイクルの先頭で確認し、idle 待ちも中断する。
//! 停止が効くまでにかかるのは、実行中の store 呼び出し高々 1 回分。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::acquired::{AcquiredJobs, InFlightJobs};
use super::config::SchedulerConfig;
use super::dispatcher::Dispatcher;
use super::wake::WakeSignal;
use crate::domain::{LockOwner, StoreError};
use crate::observability::SchedulerStats;
use crate::ports::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Running,
    Stopping,
    Stopped,
}

/// Timing knobs of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub max_jobs_per_acquisition: usize,
    pub lock_time: Duration,
    pub lock_owner: LockOwner,
    pub wait_time: Duration,
    pub wait_increase_factor: f64,
    pub max_wait: Duration,
}

impl From<&SchedulerConfig> for AcquisitionSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_jobs_per_acquisition: config.max_jobs_per_acquisition,
            lock_time: config.lock_time(),
            lock_owner: config.lock_owner.clone(),
            wait_time: config.wait_time(),
            wait_increase_factor: config.wait_increase_factor,
            max_wait: config.max_wait(),
        }
    }
}

pub struct AcquisitionLoop {
    settings: AcquisitionSettings,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    in_flight: Arc<InFlightJobs>,
    wake: WakeSignal,
    stats: Arc<SchedulerStats>,
}

impl AcquisitionLoop {
    pub fn new(
        settings: AcquisitionSettings,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        in_flight: Arc<InFlightJobs>,
        wake: WakeSignal,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            settings,
            store,
            dispatcher,
            in_flight,
            wake,
            stats,
        }
    }

    pub fn spawn(self) -> AcquisitionHandle {
        let (state, _) = watch::channel(AcquisitionState::Running);
        let state = Arc::new(state);
        let join = tokio::spawn(self.run(Arc::clone(&state)));
        AcquisitionHandle { state, join }
    }

    async fn run(self, state: Arc<watch::Sender<AcquisitionState>>) {
        let mut stop = state.subscribe();
        let mut error_wait = self.settings.wait_time;
        info!(lock_owner = %self.settings.lock_owner, "job acquisition started");

        loop {
            if *stop.borrow_and_update() != AcquisitionState::Running {
                break;
            }
            self.stats.record_cycle();

            let pause = match self.acquire_round().await {
                Ok(leased) => {
                    error_wait = self.settings.wait_time;
                    (leased < self.settings.max_jobs_per_acquisition).then_some(self.settings.wait_time)
                }
                Err(StoreError::Conflict(job_id)) => {
                    debug!(%job_id, "lost a lease race; retrying immediately");
                    None
                }
                Err(err) => {
                    self.stats.record_acquisition_error();
                    warn!(
                        error = %err,
                        wait_ms = u64::try_from(error_wait.as_millis()).unwrap_or(u64::MAX),
                        "job acquisition failed"
                    );
                    let pause = error_wait;
                    error_wait = Duration::try_from_secs_f64(
                        error_wait.as_secs_f64() * self.settings.wait_increase_factor,
                    )
                    .unwrap_or(self.settings.max_wait)
                    .min(self.settings.max_wait);
                    Some(pause)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    woken = self.wake.wait(pause) => {
                        if woken {
                            debug!("acquisition woken early");
                        }
                    }
                    _ = stop.changed() => {}
                }
            }
        }

        state.send_replace(AcquisitionState::Stopped);
        info!(lock_owner = %self.settings.lock_owner, "job acquisition stopped");
    }

    /// One round: lease, skip what is already in flight, dispatch the rest.
    /// Returns how many batches the store leased.
    #[instrument(skip_all, fields(lock_owner = %self.settings.lock_owner))]
    async fn acquire_round(&self) -> Result<usize, StoreError> {
        let batches = self
            .store
            .acquire(
                self.settings.max_jobs_per_acquisition,
                self.settings.lock_time,
                &self.settings.lock_owner,
            )
            .await?;
        let leased = batches.len();

        let mut acquired = AcquiredJobs::new();
        for batch in batches {
            acquired.add_batch(batch);
        }
        if acquired.size() > 0 {
            debug!(batches = leased, jobs = acquired.size(), "jobs acquired");
        }

        for batch in acquired.into_batches() {
            let fresh: Vec<_> = batch
                .job_ids
                .iter()
                .copied()
                .filter(|job_id| self.in_flight.claim(*job_id))
                .collect();
            if fresh.len() < batch.len() {
                debug!(
                    batch_id = %batch.id,
                    skipped = batch.len() - fresh.len(),
                    "jobs already in flight; skipping"
                );
            }
            if fresh.is_empty() {
                continue;
            }
            self.stats.record_acquired(fresh.len());
            self.dispatcher.dispatch(batch.with_job_ids(fresh)).await;
        }

        Ok(leased)
    }
}

/// Owner's side of a spawned acquisition loop.
pub struct AcquisitionHandle {
    state: Arc<watch::Sender<AcquisitionState>>,
    join: JoinHandle<()>,
}

impl AcquisitionHandle {
    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    /// Request a stop and wait until the loop has exited.
    pub async fn stop_and_join(self) {
        self.state.send_if_modified(|state| {
            if *state == AcquisitionState::Running {
                *state = AcquisitionState::Stopping;
                true
            } else {
                false
            }
        });
        if let Err(err) = self.join.await {
            error!(error = %err, "acquisition task ended abnormally");
            self.state.send_replace(AcquisitionState::Stopped);
        }
    }
}
