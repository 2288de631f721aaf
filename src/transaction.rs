//! Transaction Module
//!
//! A migration step runs inside exactly one transaction. [`Transaction`] issues
//! `BEGIN`/`COMMIT`/`ROLLBACK` through the session's executor, so every
//! statement executed through the same executor in between belongs to it.
//! Dropping a transaction that was neither committed nor rolled back rolls it
//! back.

use crate::executor::{ExecutorError, SchemaExecutor};
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// Error raised by the executor while beginning/committing/rolling back
    Executor(ExecutorError),
    /// Transaction already committed or rolled back
    TransactionClosed,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::Executor(e) => write!(f, "Transaction error: {e}"),
            TransactionError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransactionError::Executor(e) => Some(e),
            TransactionError::TransactionClosed => None,
        }
    }
}

impl From<ExecutorError> for TransactionError {
    fn from(err: ExecutorError) -> Self {
        TransactionError::Executor(err)
    }
}

/// An open database transaction on a `SchemaExecutor` session
pub struct Transaction<'a> {
    executor: &'a dyn SchemaExecutor,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Begin a transaction on `executor`
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if the `BEGIN` statement fails.
    pub fn begin(executor: &'a dyn SchemaExecutor) -> Result<Self, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        executor.execute(executor.dialect().begin_statement(), &[])?;
        Ok(Self {
            executor,
            closed: false,
        })
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if `COMMIT` fails; the transaction is then rolled back
    /// on drop.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }
        self.executor.execute("COMMIT", &[])?;
        self.closed = true;
        Ok(())
    }

    /// Rollback the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }
        self.closed = true;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.executor.execute("ROLLBACK", &[])?;
        Ok(())
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.executor.execute("ROLLBACK", &[]) {
                log::warn!("Rollback of abandoned transaction failed: {e}");
            }
        }
    }
}
