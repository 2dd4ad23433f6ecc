//! Transaction context: staged writes plus commit/rollback listeners.
//!
//! The persistence layer's transactions are modelled explicitly:
//! - writes made while a job runs are staged here and reach the store in
//!   one `JobStore::commit`
//! - listeners registered with `on_commit` run only after that commit
//!   succeeded, `on_rollback` listeners only after a rollback
//! - listeners run inline, in registration order, exactly once
//!
//! `commit` and `rollback` consume the transaction, so a transaction cannot
//! end twice.

mod command;

pub use self::command::{Command, CommandExecutor};

use std::fmt;
use std::mem;

use async_trait::async_trait;

use crate::domain::StoreError;
use crate::ports::{JobStore, StoreWrite};

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack { reason: String },
}

/// Callback attached to a transaction boundary.
#[async_trait]
pub trait TransactionListener: Send {
    async fn notify(self: Box<Self>, outcome: &TransactionOutcome);
}

#[derive(Default)]
pub struct Transaction {
    writes: Vec<StoreWrite>,
    on_commit: Vec<Box<dyn TransactionListener>>,
    on_rollback: Vec<Box<dyn TransactionListener>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, write: StoreWrite) {
        self.writes.push(write);
    }

    pub fn staged(&self) -> &[StoreWrite] {
        &self.writes
    }

    pub fn on_commit(&mut self, listener: impl TransactionListener + 'static) {
        self.on_commit.push(Box::new(listener));
    }

    pub fn on_rollback(&mut self, listener: impl TransactionListener + 'static) {
        self.on_rollback.push(Box::new(listener));
    }

    /// Apply the staged writes, then run the commit listeners.
    ///
    /// If the store refuses the writes the transaction rolls back instead:
    /// rollback listeners run with the store error as reason, and the error
    /// is returned.
    pub async fn commit(mut self, store: &dyn JobStore) -> Result<(), StoreError> {
        let writes = mem::take(&mut self.writes);
        if !writes.is_empty()
            && let Err(err) = store.commit(writes).await
        {
            self.rollback(err.to_string()).await;
            return Err(err);
        }

        let outcome = TransactionOutcome::Committed;
        for listener in mem::take(&mut self.on_commit) {
            listener.notify(&outcome).await;
        }
        Ok(())
    }

    /// Discard the staged writes and run the rollback listeners.
    pub async fn rollback(mut self, reason: impl Into<String>) {
        self.writes.clear();
        let outcome = TransactionOutcome::RolledBack {
            reason: reason.into(),
        };
        for listener in mem::take(&mut self.on_rollback) {
            listener.notify(&outcome).await;
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("writes", &self.writes)
            .field("on_commit", &self.on_commit.len())
            .field("on_rollback", &self.on_rollback.len())
            .finish()
    }
}
