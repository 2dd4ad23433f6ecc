//! Job row model.
//!
//! The store owns job rows; the scheduler core only ever holds copies and
//! refers to jobs by `JobId`. State changes go through the store, the
//! mutators here are what a store applies under its own lock.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, LockOwner};

/// Retries a new job gets unless told otherwise.
pub const DEFAULT_RETRIES: u32 = 3;

/// Lifecycle state of a job row.
///
/// Transitions:
/// - Active -> (deleted) on success without repeat
/// - Active -> Active on success with repeat, or on a failure with retries left
/// - Active -> Failed when retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for acquisition once due and unleased.
    Active,

    /// Retries exhausted. Kept for diagnostics, never acquired again.
    Failed,
}

/// Error captured from a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            failed_at,
        }
    }
}

/// A unit of deferred work as stored in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Selects the `JobHandler` that executes this job.
    pub handler_type: String,

    /// Opaque handler input.
    pub payload: serde_json::Value,

    /// Eligible for acquisition when `due_time <= now`.
    pub due_time: DateTime<Utc>,

    pub lock_owner: Option<LockOwner>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub retries_left: u32,

    /// Failed executions so far (drives the retry delay).
    pub failures: u32,

    /// Never runs concurrently with other exclusive jobs of the same `resource_key`.
    pub exclusive: bool,
    pub resource_key: Option<String>,

    /// Recurrence descriptor; set means "reschedule on success".
    pub repeat: Option<String>,

    pub last_failure: Option<JobFailure>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_time <= now
    }

    /// Someone holds a lease that has not expired yet.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expires_at.is_some_and(|expires| expires > now)
    }

    pub fn is_leased_by(&self, owner: &LockOwner, now: DateTime<Utc>) -> bool {
        self.is_leased(now) && self.lock_owner.as_ref() == Some(owner)
    }

    /// What the store's acquisition query selects.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self.retries_left > 0
            && self.is_due(now)
            && !self.is_leased(now)
    }

    /// Key this job serializes on, if it is exclusive.
    pub fn exclusive_key(&self) -> Option<&str> {
        if self.exclusive {
            self.resource_key.as_deref()
        } else {
            None
        }
    }

    pub fn lease(&mut self, owner: LockOwner, expires_at: DateTime<Utc>) {
        self.lock_owner = Some(owner);
        self.lock_expires_at = Some(expires_at);
    }

    pub fn release_lease(&mut self) {
        self.lock_owner = None;
        self.lock_expires_at = None;
    }

    pub fn mark_failed(&mut self, failure: JobFailure) {
        self.state = JobState::Failed;
        self.last_failure = Some(failure);
        self.release_lease();
    }
}

/// Everything needed to create a job; the id and timestamps are assigned
/// when it is staged in a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub handler_type: String,
    pub payload: serde_json::Value,

    /// `None` means due immediately.
    pub due_time: Option<DateTime<Utc>>,
    pub retries: u32,
    pub exclusive: bool,
    pub resource_key: Option<String>,
    pub repeat: Option<String>,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            handler_type: handler_type.into(),
            payload: serde_json::Value::Null,
            due_time: None,
            retries: DEFAULT_RETRIES,
            exclusive: false,
            resource_key: None,
            repeat: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    pub fn due_in(self, now: DateTime<Utc>, delay: TimeDelta) -> Self {
        self.due_at(now + delay)
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Make the job exclusive on `resource_key`.
    pub fn exclusive_on(mut self, resource_key: impl Into<String>) -> Self {
        self.exclusive = true;
        self.resource_key = Some(resource_key.into());
        self
    }

    /// Attach to a resource without exclusivity.
    pub fn for_resource(mut self, resource_key: impl Into<String>) -> Self {
        self.resource_key = Some(resource_key.into());
        self
    }

    pub fn repeating(mut self, repeat: impl Into<String>) -> Self {
        self.repeat = Some(repeat.into());
        self
    }

    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            handler_type: self.handler_type,
            payload: self.payload,
            due_time: self.due_time.unwrap_or(now),
            lock_owner: None,
            lock_expires_at: None,
            retries_left: self.retries,
            failures: 0,
            exclusive: self.exclusive,
            resource_key: self.resource_key,
            repeat: self.repeat,
            last_failure: None,
            state: JobState::Active,
            created_at: now,
        }
    }
}
