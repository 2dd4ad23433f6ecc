//! End-to-end scheduling properties, exercised against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use tempo_core::domain::{
    BatchId, Job, JobError, JobFailure, JobId, JobState, LeaseBatch, LockOwner, NewJob, StoreError,
};
use tempo_core::executor::{
    AcquisitionHandle, AcquisitionLoop, AcquisitionSettings, BatchExecutor, Dispatcher, InFlightJobs, JobScheduler,
    PoolSettings, RejectedBatchHandler, SchedulerConfig, WakeSignal,
};
use tempo_core::handler::{JobContext, JobHandler};
use tempo_core::impls::InMemoryJobStore;
use tempo_core::observability::SchedulerStats;
use tempo_core::ports::{JobCounts, JobStore, StoreWrite};

const LEASE: Duration = Duration::from_secs(60);

async fn eventually(mut check: impl AsyncFnMut() -> bool) {
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Delegates to an in-memory store; records how many batches each acquire
/// call leased and optionally holds acquire calls until a permit is added.
struct ObservedStore {
    inner: InMemoryJobStore,
    gate: Option<Semaphore>,
    leased: Mutex<Vec<usize>>,
}

impl ObservedStore {
    fn open() -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            gate: None,
            leased: Mutex::new(Vec::new()),
        }
    }

    fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::open()
        }
    }

    fn acquire_calls(&self) -> usize {
        self.leased.lock().unwrap().len()
    }
}

#[async_trait]
impl JobStore for ObservedStore {
    async fn acquire(
        &self,
        max_jobs: usize,
        lease: Duration,
        owner: &LockOwner,
    ) -> Result<Vec<LeaseBatch>, StoreError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let batches = self.inner.acquire(max_jobs, lease, owner).await?;
        self.leased.lock().unwrap().push(batches.len());
        Ok(batches)
    }

    async fn find(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.find(job_id).await
    }

    async fn commit(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError> {
        self.inner.commit(writes).await
    }

    async fn decrement_retries(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        failure: JobFailure,
    ) -> Result<Job, StoreError> {
        self.inner.decrement_retries(job_id, owner, failure).await
    }

    async fn release_lease(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        due_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.inner.release_lease(job_id, owner, due_time).await
    }

    async fn mark_permanently_failed(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        failure: JobFailure,
    ) -> Result<(), StoreError> {
        self.inner.mark_permanently_failed(job_id, owner, failure).await
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        self.inner.counts().await
    }

    async fn failed_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.failed_jobs().await
    }
}

/// Records every dispatched job id, then releases its claim.
struct Collect {
    in_flight: Arc<InFlightJobs>,
    seen: Mutex<Vec<JobId>>,
}

#[async_trait]
impl BatchExecutor for Collect {
    async fn execute_batch(&self, batch: LeaseBatch) {
        self.seen.lock().unwrap().extend(batch.job_ids.iter().copied());
        self.in_flight.release_all(&batch.job_ids);
    }
}

struct CountRejections(AtomicUsize);

#[async_trait]
impl RejectedBatchHandler for CountRejections {
    async fn batch_rejected(&self, batch: LeaseBatch, dispatcher: &Dispatcher) {
        self.0.fetch_add(1, Ordering::SeqCst);
        dispatcher.abandon(&batch);
    }
}

fn acquisition(max_jobs: usize, wait: Duration) -> AcquisitionSettings {
    AcquisitionSettings {
        max_jobs_per_acquisition: max_jobs,
        lock_time: LEASE,
        lock_owner: LockOwner::new("node-a"),
        wait_time: wait,
        wait_increase_factor: 1.0,
        max_wait: wait,
    }
}

fn pool(queue_size: usize, core: usize, max: usize) -> PoolSettings {
    PoolSettings {
        queue_size,
        core_pool_size: core,
        max_pool_size: max,
        keep_alive: Duration::ZERO,
    }
}

struct LoopHarness {
    collect: Arc<Collect>,
    in_flight: Arc<InFlightJobs>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<SchedulerStats>,
    wake: WakeSignal,
}

fn loop_harness() -> LoopHarness {
    let in_flight = Arc::new(InFlightJobs::new());
    let collect = Arc::new(Collect {
        in_flight: in_flight.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let stats = Arc::new(SchedulerStats::new());
    let dispatcher = Arc::new(Dispatcher::new(
        pool(10, 2, 4),
        collect.clone(),
        Arc::new(CountRejections(AtomicUsize::new(0))),
        in_flight.clone(),
        stats.clone(),
    ));
    LoopHarness {
        collect,
        in_flight,
        dispatcher,
        stats,
        wake: WakeSignal::new(),
    }
}

impl LoopHarness {
    fn spawn(
        &self,
        settings: AcquisitionSettings,
        store: Arc<dyn JobStore>,
    ) -> AcquisitionHandle {
        AcquisitionLoop::new(
            settings,
            store,
            self.dispatcher.clone(),
            self.in_flight.clone(),
            self.wake.clone(),
            self.stats.clone(),
        )
        .spawn()
    }

    fn seen(&self) -> Vec<JobId> {
        self.collect.seen.lock().unwrap().clone()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_instances_never_lease_the_same_job() {
    let store = Arc::new(InMemoryJobStore::new());
    for _ in 0..200 {
        store.insert(NewJob::new("t")).await;
    }

    let race = |owner: &'static str| {
        let store = store.clone();
        tokio::spawn(async move {
            let owner = LockOwner::new(owner);
            let mut leased = Vec::new();
            loop {
                let batches = store.acquire(7, LEASE, &owner).await.unwrap();
                if batches.is_empty() {
                    return leased;
                }
                leased.extend(batches.into_iter().flat_map(|b| b.job_ids));
            }
        })
    };

    let (a, b) = tokio::join!(race("node-a"), race("node-b"));
    let (a, b) = (a.unwrap(), b.unwrap());

    let a_set: HashSet<JobId> = a.iter().copied().collect();
    let b_set: HashSet<JobId> = b.iter().copied().collect();
    assert_eq!(a_set.len(), a.len());
    assert_eq!(b_set.len(), b.len());
    assert!(a_set.is_disjoint(&b_set));
    assert_eq!(a_set.len() + b_set.len(), 200);
}

#[tokio::test]
async fn rounds_drain_the_store_without_duplicates() {
    let h = loop_harness();
    let store = Arc::new(ObservedStore::open());
    for _ in 0..5 {
        store.inner.insert(NewJob::new("t")).await;
    }

    let handle = h.spawn(acquisition(2, Duration::from_secs(30)), store.clone());
    eventually(async || h.seen().len() == 5).await;
    handle.stop_and_join().await;

    assert_eq!(store.leased.lock().unwrap()[..3], [2, 2, 1]);
    let unique: HashSet<JobId> = h.seen().into_iter().collect();
    assert_eq!(unique.len(), 5);
    assert!(h.in_flight.is_empty());
}

#[tokio::test]
async fn wake_ups_during_a_round_coalesce_into_one_extra_cycle() {
    let h = loop_harness();
    let store = Arc::new(ObservedStore::gated());
    let handle = h.spawn(acquisition(3, Duration::from_secs(30)), store.clone());

    // let the first round block inside the store
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..1000 {
        h.wake.notify();
    }
    store.gate.as_ref().unwrap().add_permits(10_000);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.acquire_calls(), 2);

    handle.stop_and_join().await;
}

/// Blocks every batch until the gate opens.
struct Blocked {
    gate: Arc<Semaphore>,
    done: AtomicUsize,
}

#[async_trait]
impl BatchExecutor for Blocked {
    async fn execute_batch(&self, _batch: LeaseBatch) {
        let _permit = self.gate.acquire().await.unwrap();
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn saturation_rejects_exactly_one_batch() {
    let (queue_size, core, max) = (3, 3, 10);
    let gate = Arc::new(Semaphore::new(0));
    let executor = Arc::new(Blocked {
        gate: gate.clone(),
        done: AtomicUsize::new(0),
    });
    let rejections = Arc::new(CountRejections(AtomicUsize::new(0)));
    let dispatcher = Dispatcher::new(
        pool(queue_size, core, max),
        executor.clone(),
        rejections.clone(),
        Arc::new(InFlightJobs::new()),
        Arc::new(SchedulerStats::new()),
    );

    let submit = async {
        for _ in 0..queue_size + max + 1 {
            let batch = LeaseBatch::new(
                BatchId::generate(),
                vec![JobId::generate()],
                LockOwner::new("node-a"),
                Utc::now(),
            );
            dispatcher.dispatch(batch).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), submit)
        .await
        .expect("dispatch must never block");

    assert_eq!(rejections.0.load(Ordering::SeqCst), 1);

    gate.add_permits(1000);
    dispatcher.shutdown(Duration::from_secs(5)).await;
    assert_eq!(executor.done.load(Ordering::SeqCst), queue_size + max);
}

/// Always fails.
struct Failing(Arc<AtomicUsize>);

#[async_trait]
impl JobHandler for Failing {
    fn handler_type(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(JobError::failed("downstream unavailable"))
    }
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_wait_time(Duration::from_millis(200))
        .with_shutdown_grace(Duration::from_secs(5))
}

#[tokio::test]
async fn exhausted_retries_leave_a_failed_job_behind() {
    let store = Arc::new(InMemoryJobStore::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = JobScheduler::builder(store.clone())
        .config(scheduler_config())
        .register(Failing(runs.clone()))
        .unwrap()
        .build()
        .unwrap();
    scheduler.start();

    let job_id = scheduler
        .schedule(NewJob::new("failing").with_retries(4))
        .await
        .unwrap();
    eventually(async || scheduler.failed_jobs().await.unwrap().len() == 1).await;

    // a few more idle rounds must not pick the job up again
    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.shutdown().await;

    assert_eq!(runs.load(Ordering::SeqCst), 4);
    let job = store.find(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retries_left, 0);
    assert_eq!(job.failures, 4);
    assert_eq!(
        job.last_failure.map(|failure| failure.message),
        Some("downstream unavailable".to_owned())
    );
    assert!(
        store
            .acquire(10, LEASE, &LockOwner::new("other"))
            .await
            .unwrap()
            .is_empty()
    );
}

/// One execution as seen from inside the handler.
#[derive(Debug, Clone)]
struct Run {
    task: tokio::task::Id,
    key: String,
    seq: Option<u64>,
}

type RunLog = Arc<Mutex<Vec<Run>>>;

fn record(log: &RunLog, ctx: &JobContext<'_>, seq: Option<u64>) {
    log.lock().unwrap().push(Run {
        task: tokio::task::id(),
        key: ctx.job().resource_key.clone().unwrap_or_default(),
        seq,
    });
}

/// Creates `children` exclusive jobs on its own resource.
struct Parent {
    children: usize,
    log: RunLog,
}

#[async_trait]
impl JobHandler for Parent {
    fn handler_type(&self) -> &str {
        "parent"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        record(&self.log, ctx, None);
        let key = ctx.job().resource_key.clone().unwrap_or_default();
        for seq in 0..self.children {
            ctx.schedule(
                NewJob::new("child")
                    .exclusive_on(key.clone())
                    .with_payload(serde_json::json!({ "seq": seq })),
            );
        }
        Ok(())
    }
}

struct Child {
    log: RunLog,
}

#[async_trait]
impl JobHandler for Child {
    fn handler_type(&self) -> &str {
        "child"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        let payload: serde_json::Value = ctx.payload()?;
        record(&self.log, ctx, payload["seq"].as_u64());
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_children_run_in_creation_order_on_one_worker() {
    let store = Arc::new(InMemoryJobStore::new());
    let log: RunLog = Arc::new(Mutex::new(Vec::new()));
    let scheduler = JobScheduler::builder(store.clone())
        .config(scheduler_config())
        .register(Parent {
            children: 20,
            log: log.clone(),
        })
        .unwrap()
        .register(Child { log: log.clone() })
        .unwrap()
        .build()
        .unwrap();
    scheduler.start();

    for key in ["order-1", "order-2"] {
        scheduler
            .schedule(NewJob::new("parent").exclusive_on(key))
            .await
            .unwrap();
    }
    eventually(async || store.is_empty().await).await;
    scheduler.shutdown().await;

    let log = log.lock().unwrap().clone();
    for key in ["order-1", "order-2"] {
        let runs: Vec<&Run> = log.iter().filter(|run| run.key == key).collect();
        let task = runs[0].task;
        assert!(runs.iter().all(|run| run.task == task), "{key} moved between workers");

        let mut expected = vec![None];
        expected.extend((0..20).map(Some));
        let seqs: Vec<Option<u64>> = runs.iter().map(|run| run.seq).collect();
        assert_eq!(seqs, expected, "{key} out of order");

        // nothing else ran on that worker while the chain was in progress
        let on_worker: Vec<&Run> = log.iter().filter(|run| run.task == task).collect();
        let first = on_worker.iter().position(|run| run.key == key).unwrap();
        let last = on_worker.iter().rposition(|run| run.key == key).unwrap();
        assert!(on_worker[first..=last].iter().all(|run| run.key == key));
    }
}

/// Sleeps while counting overlapping runs; fails the first attempt of jobs
/// whose payload asks for it.
struct Slow {
    running: AtomicUsize,
    peak: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for Slow {
    fn handler_type(&self) -> &str {
        "slow"
    }

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if ctx.job().payload["fail_once"].as_bool() == Some(true) && ctx.job().failures == 0 {
            return Err(JobError::failed("first attempt"));
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retried_exclusive_job_waits_for_its_sibling() {
    let store = Arc::new(InMemoryJobStore::new());
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = JobScheduler::builder(store.clone())
        .config(scheduler_config().with_wait_time(Duration::from_millis(20)))
        .register(Slow {
            running: AtomicUsize::new(0),
            peak: peak.clone(),
            runs: runs.clone(),
        })
        .unwrap()
        .build()
        .unwrap();
    scheduler.start();

    scheduler
        .schedule(
            NewJob::new("slow")
                .exclusive_on("K")
                .with_payload(serde_json::json!({ "fail_once": true })),
        )
        .await
        .unwrap();
    eventually(async || runs.load(Ordering::SeqCst) == 1).await;
    scheduler
        .schedule(NewJob::new("slow").exclusive_on("K"))
        .await
        .unwrap();

    eventually(async || store.is_empty().await).await;
    scheduler.shutdown().await;

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
