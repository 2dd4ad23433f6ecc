//! In-memory implementations of the ports, for development and tests.
//!
//! A production deployment supplies its own `JobStore` backed by a database
//! that can do an atomic conditional update on the lease columns.

pub mod inmem_store;
pub mod recurrence;

pub use self::inmem_store::InMemoryJobStore;
pub use self::recurrence::IntervalRecurrence;
