//! JobScheduler: lifecycle facade over acquisition, dispatch and execution.
//!
//! Built once through `JobSchedulerBuilder`, which validates the config and
//! the handler registry up front. `start` spawns the acquisition loop and a
//! fresh worker pool; `shutdown` stops the loop, joins it, then drains the
//! pool within the grace period. Both are idempotent, and a scheduler can
//! be started again after a shutdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use super::acquired::InFlightJobs;
use super::acquisition::{AcquisitionHandle, AcquisitionLoop, AcquisitionState};
use super::config::SchedulerConfig;
use super::dispatcher::Dispatcher;
use super::failure::{DefaultFailedJobCommandFactory, FailedJobCommandFactory};
use super::notify::JobAddedNotification;
use super::pool::PoolSettings;
use super::rejected::{DropRejectedBatches, RejectedBatchHandler};
use super::runner::JobRunner;
use super::services::JobServices;
use super::wake::WakeSignal;
use crate::domain::{Job, JobId, LockOwner, NewJob, SchedulerError};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::impls::IntervalRecurrence;
use crate::observability::{SchedulerStats, StatsSnapshot};
use crate::ports::{
    Clock, IdGenerator, JobStore, Recurrence, StoreWrite, SystemClock, UlidGenerator,
};
use crate::tx::{Command, CommandExecutor, Transaction};

pub struct JobSchedulerBuilder {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    recurrence: Arc<dyn Recurrence>,
    rejected: Arc<dyn RejectedBatchHandler>,
    failures: Option<Arc<dyn FailedJobCommandFactory>>,
}

impl JobSchedulerBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: SchedulerConfig::default(),
            registry: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
            ids: None,
            recurrence: Arc::new(IntervalRecurrence),
            rejected: Arc::new(DropRejectedBatches),
            failures: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler; a second handler for the same type is an error.
    pub fn register(mut self, handler: impl JobHandler + 'static) -> Result<Self, SchedulerError> {
        self.registry.register(Arc::new(handler))?;
        Ok(self)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn recurrence(mut self, recurrence: Arc<dyn Recurrence>) -> Self {
        self.recurrence = recurrence;
        self
    }

    pub fn rejected_batch_handler(mut self, handler: Arc<dyn RejectedBatchHandler>) -> Self {
        self.rejected = handler;
        self
    }

    pub fn failed_job_command_factory(mut self, factory: Arc<dyn FailedJobCommandFactory>) -> Self {
        self.failures = Some(factory);
        self
    }

    /// Validate and assemble. With `autoActivate` the scheduler is started
    /// right away, which requires a tokio runtime.
    pub fn build(self) -> Result<JobScheduler, SchedulerError> {
        self.config.validate()?;

        let wake = WakeSignal::new();
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock)));
        let services = Arc::new(JobServices {
            clock: Arc::clone(&self.clock),
            ids,
            recurrence: self.recurrence,
            wake: wake.clone(),
            lock_owner: self.config.lock_owner.clone(),
            lock_time: self.config.lock_time(),
        });
        let failures = self.failures.unwrap_or_else(|| {
            Arc::new(DefaultFailedJobCommandFactory::new(
                self.config.retry_policy(),
                wake.clone(),
                Arc::clone(&self.clock),
            ))
        });

        let in_flight = Arc::new(InFlightJobs::new());
        let stats = Arc::new(SchedulerStats::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&self.store),
            Arc::new(self.registry),
            Arc::clone(&services),
            failures,
            Arc::clone(&in_flight),
            Arc::clone(&stats),
        ));

        let scheduler = JobScheduler {
            commands: CommandExecutor::new(Arc::clone(&self.store)),
            store: self.store,
            config: self.config,
            services,
            runner,
            rejected: self.rejected,
            in_flight,
            stats,
            active: Mutex::new(None),
        };
        if scheduler.config.auto_activate {
            scheduler.start();
        }
        Ok(scheduler)
    }
}

struct Active {
    acquisition: AcquisitionHandle,
    dispatcher: Arc<Dispatcher>,
}

pub struct JobScheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    commands: CommandExecutor,
    services: Arc<JobServices>,
    runner: Arc<JobRunner>,
    rejected: Arc<dyn RejectedBatchHandler>,
    in_flight: Arc<InFlightJobs>,
    stats: Arc<SchedulerStats>,
    active: Mutex<Option<Active>>,
}

impl JobScheduler {
    pub fn builder(store: Arc<dyn JobStore>) -> JobSchedulerBuilder {
        JobSchedulerBuilder::new(store)
    }

    /// Spawn the acquisition loop and the worker pool. No-op when already
    /// active. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut active = self.lock_active();
        if active.is_some() {
            debug!("scheduler already active");
            return;
        }

        let dispatcher = Arc::new(Dispatcher::new(
            PoolSettings::from(&self.config),
            self.runner.clone(),
            Arc::clone(&self.rejected),
            Arc::clone(&self.in_flight),
            Arc::clone(&self.stats),
        ));
        let acquisition = AcquisitionLoop::new(
            (&self.config).into(),
            Arc::clone(&self.store),
            Arc::clone(&dispatcher),
            Arc::clone(&self.in_flight),
            self.services.wake.clone(),
            Arc::clone(&self.stats),
        )
        .spawn();

        *active = Some(Active {
            acquisition,
            dispatcher,
        });
        info!(
            lock_owner = %self.config.lock_owner,
            core_pool_size = self.config.core_pool_size,
            max_pool_size = self.config.max_pool_size,
            "scheduler started"
        );
    }

    /// Stop acquiring, then let in-flight batches finish within the grace
    /// period. No-op when not active.
    pub async fn shutdown(&self) {
        let Some(active) = self.lock_active().take() else {
            debug!("scheduler not active");
            return;
        };

        info!(lock_owner = %self.config.lock_owner, "scheduler shutting down");
        active.acquisition.stop_and_join().await;
        active.dispatcher.shutdown(self.config.shutdown_grace()).await;
        info!(lock_owner = %self.config.lock_owner, "scheduler stopped");
    }

    pub fn is_active(&self) -> bool {
        self.lock_active().is_some()
    }

    pub fn acquisition_state(&self) -> AcquisitionState {
        self.lock_active()
            .as_ref()
            .map_or(AcquisitionState::Stopped, |active| active.acquisition.state())
    }

    /// Wake the acquisition loop. Fire and forget.
    pub fn notify_job_added(&self) {
        self.services.wake.notify();
    }

    /// Insert a job in its own transaction and wake acquisition on commit.
    pub async fn schedule(&self, new_job: NewJob) -> Result<JobId, SchedulerError> {
        let job = new_job.into_job(self.services.ids.generate_job_id(), self.services.clock.now());
        let job_id = job.id;
        self.commands
            .execute(Box::new(ScheduleJob {
                job,
                services: Arc::clone(&self.services),
            }))
            .await?;
        Ok(job_id)
    }

    pub async fn stats(&self) -> Result<StatsSnapshot, SchedulerError> {
        let counts = self.store.counts().await?;
        Ok(self.stats.snapshot(counts))
    }

    /// Permanently failed jobs with their last error.
    pub async fn failed_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.failed_jobs().await?)
    }

    pub fn lock_owner(&self) -> &LockOwner {
        &self.config.lock_owner
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ScheduleJob {
    job: Job,
    services: Arc<JobServices>,
}

#[async_trait]
impl Command for ScheduleJob {
    async fn execute(
        self: Box<Self>,
        tx: &mut Transaction,
        _store: &dyn JobStore,
    ) -> Result<(), SchedulerError> {
        let job_id = self.job.id;
        tx.stage(StoreWrite::Insert(self.job));
        tx.on_commit(JobAddedNotification::new(self.services.wake.clone()));
        debug!(%job_id, "job scheduled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::domain::{JobError, JobState};
    use crate::handler::JobContext;
    use crate::impls::InMemoryJobStore;

    struct Counting {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for Counting {
        fn handler_type(&self) -> &str {
            "count"
        }

        async fn execute(&self, _ctx: &mut JobContext<'_>) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(JobError::failed("always fails"));
            }
            Ok(())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_wait_time(Duration::from_secs(30))
            .with_lock_owner(LockOwner::new("node-test"))
            .with_shutdown_grace(Duration::from_secs(5))
    }

    fn scheduler(store: Arc<InMemoryJobStore>, fail: bool) -> (JobScheduler, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = JobScheduler::builder(store)
            .config(config())
            .register(Counting {
                runs: runs.clone(),
                fail,
            })
            .unwrap()
            .build()
            .unwrap();
        (scheduler, runs)
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn build_rejects_invalid_config() {
        let result = JobScheduler::builder(Arc::new(InMemoryJobStore::new()))
            .config(SchedulerConfig::default().with_pool(3, 5, 2))
            .build();
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn build_rejects_duplicate_handlers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let result = JobScheduler::builder(Arc::new(InMemoryJobStore::new()))
            .register(Counting {
                runs: runs.clone(),
                fail: false,
            })
            .and_then(|builder| builder.register(Counting { runs, fail: false }));
        assert!(matches!(result, Err(SchedulerError::DuplicateHandler(t)) if t == "count"));
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let (scheduler, _) = scheduler(Arc::new(InMemoryJobStore::new()), false);
        assert!(!scheduler.is_active());
        assert_eq!(scheduler.acquisition_state(), AcquisitionState::Stopped);

        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_active());
        assert_eq!(scheduler.acquisition_state(), AcquisitionState::Running);

        scheduler.shutdown().await;
        scheduler.shutdown().await;
        assert!(!scheduler.is_active());

        // restart with a fresh pool
        scheduler.start();
        assert!(scheduler.is_active());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn auto_activate_starts_on_build() {
        let scheduler = JobScheduler::builder(Arc::new(InMemoryJobStore::new()))
            .config(config().with_auto_activate(true))
            .build()
            .unwrap();
        assert!(scheduler.is_active());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn scheduled_job_runs_without_waiting_for_the_idle_timeout() {
        let store = Arc::new(InMemoryJobStore::new());
        let (scheduler, runs) = scheduler(store.clone(), false);
        scheduler.start();

        scheduler.schedule(NewJob::new("count")).await.unwrap();

        eventually(async || store.is_empty().await).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.jobs_succeeded, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn failing_job_ends_permanently_failed() {
        let store = Arc::new(InMemoryJobStore::new());
        let (scheduler, runs) = scheduler(store.clone(), true);
        scheduler.start();

        let job_id = scheduler
            .schedule(NewJob::new("count").with_retries(3))
            .await
            .unwrap();

        eventually(async || scheduler.failed_jobs().await.unwrap().len() == 1).await;
        scheduler.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let failed = scheduler.failed_jobs().await.unwrap();
        assert_eq!(failed[0].id, job_id);
        assert_eq!(failed[0].state, JobState::Failed);
        assert_eq!(scheduler.stats().await.unwrap().jobs.failed, 1);
    }

    /// Hangs on its first run, succeeds afterwards.
    struct HangsOnce {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for HangsOnce {
        fn handler_type(&self) -> &str {
            "hang"
        }

        async fn execute(&self, _ctx: &mut JobContext<'_>) -> Result<(), JobError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn job_aborted_by_shutdown_runs_again_after_restart() {
        let store = Arc::new(InMemoryJobStore::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = JobScheduler::builder(store.clone())
            .config(
                config()
                    .with_wait_time(Duration::from_millis(50))
                    .with_wait_backoff(1.0, Duration::from_millis(50))
                    .with_lock_time(Duration::from_millis(300))
                    .with_shutdown_grace(Duration::from_millis(50)),
            )
            .register(HangsOnce { runs: runs.clone() })
            .unwrap()
            .build()
            .unwrap();
        scheduler.start();

        scheduler.schedule(NewJob::new("hang")).await.unwrap();
        eventually(async || runs.load(Ordering::SeqCst) == 1).await;
        scheduler.shutdown().await;
        assert_eq!(store.len().await, 1);

        scheduler.start();
        eventually(async || store.is_empty().await).await;
        scheduler.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
