//! Command pattern: one unit of work, one transaction.

use std::sync::Arc;

use async_trait::async_trait;

use super::Transaction;
use crate::domain::SchedulerError;
use crate::ports::JobStore;

/// A unit of work executed inside its own transaction.
///
/// Store reads and single-row updates go straight to `store`; anything that
/// must only happen if the command succeeds is staged on `tx` or registered
/// as a commit listener.
#[async_trait]
pub trait Command: Send {
    async fn execute(
        self: Box<Self>,
        tx: &mut Transaction,
        store: &dyn JobStore,
    ) -> Result<(), SchedulerError>;
}

/// Runs commands, each in a fresh transaction.
#[derive(Clone)]
pub struct CommandExecutor {
    store: Arc<dyn JobStore>,
}

impl CommandExecutor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Open a transaction, run `command`, then commit on `Ok` or roll back
    /// on `Err`.
    pub async fn execute(&self, command: Box<dyn Command>) -> Result<(), SchedulerError> {
        let mut tx = Transaction::new();
        match command.execute(&mut tx, self.store.as_ref()).await {
            Ok(()) => {
                tx.commit(self.store.as_ref()).await?;
                Ok(())
            }
            Err(err) => {
                tx.rollback(err.to_string()).await;
                Err(err)
            }
        }
    }
}
