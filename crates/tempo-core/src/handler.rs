//! Job handlers and the registry that maps `handler_type` to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::domain::{Job, JobError, JobId, NewJob, SchedulerError};
use crate::executor::{CurrentJob, JobServices};
use crate::tx::Transaction;

/// Executes jobs of one `handler_type`.
///
/// Returning `Err` rolls back everything the handler staged and sends the
/// job through the failure pipeline.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    async fn execute(&self, ctx: &mut JobContext<'_>) -> Result<(), JobError>;
}

/// Registry of handlers (handler_type -> handler).
///
/// Built during initialization, read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<(), SchedulerError> {
        let handler_type = handler.handler_type().to_owned();
        if self.handlers.contains_key(&handler_type) {
            return Err(SchedulerError::DuplicateHandler(handler_type));
        }
        self.handlers.insert(handler_type, handler);
        Ok(())
    }

    pub fn get(&self, handler_type: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(handler_type)
    }
}

/// What a handler sees of the job it executes.
///
/// Jobs created through `schedule` join the running transaction: they are
/// only inserted if the handler succeeds.
pub struct JobContext<'a> {
    job: &'a Job,
    tx: &'a mut Transaction,
    current: Option<CurrentJob>,
    sink: mpsc::UnboundedSender<JobId>,
    services: &'a JobServices,
}

impl<'a> JobContext<'a> {
    pub fn new(
        job: &'a Job,
        tx: &'a mut Transaction,
        current: Option<CurrentJob>,
        sink: mpsc::UnboundedSender<JobId>,
        services: &'a JobServices,
    ) -> Self {
        Self {
            job,
            tx,
            current,
            sink,
            services,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Decode the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// Create a follow-up job in this job's transaction.
    pub fn schedule(&mut self, new_job: NewJob) -> JobId {
        let local = self.current.as_ref().map(|current| (current, &self.sink));
        self.services.stage_new_job(self.tx, new_job, local)
    }
}
