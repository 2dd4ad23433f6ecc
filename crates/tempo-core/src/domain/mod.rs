//! Domain model (ids, jobs, lease batches, retry policy, errors).

pub mod batch;
pub mod errors;
pub mod ids;
pub mod job;
pub mod retry;

pub use self::batch::LeaseBatch;
pub use self::errors::{ErrorKind, JobError, RecurrenceError, SchedulerError, StoreError};
pub use self::ids::{BatchId, JobId, LockOwner};
pub use self::job::{DEFAULT_RETRIES, Job, JobFailure, JobState, NewJob};
pub use self::retry::RetryPolicy;
