//! Transaction error types.

use thiserror::Error;

use crate::source::SourceError;
use crate::transaction::handle::SourceKind;
use crate::transaction::options::TxOptions;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur while resolving or finishing a request transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// No transaction handle was attached to the request context.
    #[error("database transaction for request missing in context")]
    Missing,

    /// The handle has no primary database to open transactions on.
    #[error("transaction in context, but database is not configured")]
    NoDatabase,

    /// Caller asked for a different database kind than the request is bound to.
    #[error("transaction in context, but database kind is mismatched: requested {requested}, bound to {bound}")]
    KindMismatch {
        requested: SourceKind,
        bound: SourceKind,
    },

    /// Caller options contradict the options already in force.
    #[error("transaction in context, but transaction options are mismatched: requested {}, in force {}", opts_display(.requested), opts_display(.committed))]
    OptionsMismatch {
        requested: Option<TxOptions>,
        committed: Option<TxOptions>,
    },

    /// The connection behind the active transaction is gone.
    #[error("database connection not available")]
    ConnectionUnavailable,

    /// Opening the underlying transaction failed.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] SourceError),

    /// Committing the underlying transaction failed.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] SourceError),

    /// Rolling back the underlying transaction failed.
    #[error("failed to roll back transaction: {0}")]
    Rollback(#[source] SourceError),
}

fn opts_display(opts: &Option<TxOptions>) -> String {
    match opts {
        Some(opts) => format!("({})", opts),
        None => "(none)".to_string(),
    }
}

impl TransactionError {
    /// Check if this error means the database itself could not be reached.
    ///
    /// Such failures are reported to the client as-is instead of being
    /// wrapped in an internal error.
    pub fn is_unavailable(&self) -> bool {
        match self {
            TransactionError::ConnectionUnavailable => true,
            TransactionError::Begin(e)
            | TransactionError::Commit(e)
            | TransactionError::Rollback(e) => e.is_unavailable(),
            _ => false,
        }
    }

    /// Check if this error is a caller-side kind or options conflict.
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            TransactionError::KindMismatch { .. } | TransactionError::OptionsMismatch { .. }
        )
    }

    pub(crate) fn options_mismatch(
        requested: Option<TxOptions>,
        committed: Option<TxOptions>,
    ) -> Self {
        Self::OptionsMismatch {
            requested,
            committed,
        }
    }
}
