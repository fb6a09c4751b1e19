//! Database sources the coordinator opens transactions on.
//!
//! The coordinator never talks to a driver directly. A [`DatabaseSource`] is
//! anything that can open a transaction (a connection pool, an ORM handle),
//! and a [`SourceTransaction`] is the live transaction it hands back.
//!
//! # Implementors
//!
//! - [`MemorySource`] - in-memory source for tests

mod memory;

pub use memory::{MemorySource, MemoryTransaction, TxOutcome};

use thiserror::Error;

use crate::context::RequestContext;
use crate::transaction::TxOptions;

/// Result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors reported by a database source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The database could not be reached.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    /// The database rejected the operation.
    #[error("database error: {0}")]
    Database(String),
}

impl SourceError {
    /// Check if this error means the database could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// A database that transactions can be opened on.
///
/// Sources are shared across requests and are never mutated by the
/// coordinator. Honoring the request deadline is up to the implementation.
pub trait DatabaseSource: Send + Sync + 'static {
    /// The transaction type this source opens.
    type Transaction: SourceTransaction;

    /// Opens a new transaction, optionally with explicit options.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction could not be started.
    fn begin_transaction(
        &self,
        ctx: &RequestContext,
        options: Option<&TxOptions>,
    ) -> SourceResult<Self::Transaction>;
}

/// A live transaction returned by a [`DatabaseSource`].
///
/// The coordinator shares the transaction with business logic, so finishing
/// it takes `&self`; implementations keep their own interior state.
pub trait SourceTransaction: Send + Sync + 'static {
    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns the database error if the commit was rejected.
    fn commit(&self) -> SourceResult<()>;

    /// Rolls back the transaction.
    ///
    /// # Errors
    ///
    /// Returns the database error if the rollback failed.
    fn rollback(&self) -> SourceResult<()>;

    /// Returns false once the underlying connection is gone.
    fn is_connected(&self) -> bool;
}
