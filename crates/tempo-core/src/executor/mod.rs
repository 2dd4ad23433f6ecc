//! Executor: the moving parts between the job store and the handlers.
//!
//! - `acquisition`: background loop leasing due jobs
//! - `pool` / `dispatcher`: bounded worker pool with a rejected-batch policy
//! - `runner` / `context`: per-worker execution, exclusive-job sequencing
//! - `failure`: retry bookkeeping after a failed job
//! - `notify`: commit-phase notifiers
//! - `scheduler`: the lifecycle facade tying it together

mod acquired;
mod acquisition;
mod config;
mod context;
mod dispatcher;
mod failure;
mod notify;
mod pool;
mod rejected;
mod runner;
mod scheduler;
mod services;
mod wake;

pub use self::acquired::{AcquiredJobs, InFlightJobs};
pub use self::acquisition::{AcquisitionHandle, AcquisitionLoop, AcquisitionSettings, AcquisitionState};
pub use self::config::{ConfigError, SchedulerConfig};
pub use self::context::{CurrentJob, ExecutionContext};
pub use self::dispatcher::Dispatcher;
pub use self::failure::{
    DecrementJobRetries, DefaultFailedJobCommandFactory, FailedJobCommandFactory, FailedJobListener,
};
pub use self::notify::{ExclusiveJobAddedNotification, JobAddedNotification};
pub use self::pool::{BatchExecutor, PoolSettings, WorkerPool};
pub use self::rejected::{
    CallerRunsRejectedBatches, DropRejectedBatches, RejectedBatchHandler, RetryRejectedBatches,
};
pub use self::runner::JobRunner;
pub use self::scheduler::{JobScheduler, JobSchedulerBuilder};
pub use self::services::JobServices;
pub use self::wake::WakeSignal;
