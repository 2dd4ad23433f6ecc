//! Recurrence port: computes the next due time of a repeating job.

use chrono::{DateTime, Utc};

use crate::domain::RecurrenceError;

/// Next occurrence of a repeating job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextOccurrence {
    pub due_time: DateTime<Utc>,

    /// Descriptor to store for the occurrence after this one; `None` when
    /// this is the last one.
    pub repeat: Option<String>,
}

pub trait Recurrence: Send + Sync {
    /// `Ok(None)` means the recurrence is exhausted and the job is done.
    fn next(
        &self,
        repeat: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<NextOccurrence>, RecurrenceError>;
}
