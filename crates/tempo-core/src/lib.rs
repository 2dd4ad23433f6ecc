//! tempo-core
//!
//! Core of a background job scheduler: leases due jobs from a shared store,
//! runs them on a bounded worker pool, keeps exclusive jobs of one resource
//! in order, and turns failures into retries.
//!
//! # Modules
//! - **domain**: job rows, ids, lease batches, retry policy, errors
//! - **ports**: collaborators (JobStore, Clock, IdGenerator, Recurrence)
//! - **tx**: transaction context with commit/rollback listeners, commands
//! - **executor**: acquisition loop, worker pool, runner, failure pipeline
//! - **handler**: JobHandler trait and registry
//! - **impls**: in-memory store and interval recurrence for dev and tests
//! - **observability**: scheduler counters

pub mod domain;
pub mod executor;
pub mod handler;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod tx;

pub use crate::domain::{Job, JobError, JobId, LockOwner, NewJob, SchedulerError};
pub use crate::executor::{JobScheduler, JobSchedulerBuilder, SchedulerConfig};
pub use crate::handler::{HandlerRegistry, JobContext, JobHandler};
