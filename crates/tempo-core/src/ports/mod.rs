//! Ports: the collaborators the scheduler core talks to.
//!
//! Each trait stands for an external service (job store, clock, id
//! allocation, recurrence evaluation). In-memory implementations live in
//! `impls`.

pub mod clock;
pub mod id_generator;
pub mod job_store;
pub mod recurrence;

pub use self::clock::{Clock, FixedClock, SystemClock, to_delta};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{JobCounts, JobStore, StoreWrite};
pub use self::recurrence::{NextOccurrence, Recurrence};
