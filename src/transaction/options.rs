//! Transaction and database selection options.
//!
//! [`TxOptions`] describes the transaction itself (isolation, read-only).
//! [`DatabaseOptions`] is what a caller hands to
//! [`resolve_transaction`](super::resolve_transaction): the transaction
//! options plus whether the read-only replica is preferred.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transaction::isolation::IsolationLevel;

/// Options a transaction is opened with.
///
/// Every field is optional. An unset field defers to whatever another caller
/// (or the database) decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOptions {
    /// Requested isolation level.
    pub isolation: Option<IsolationLevel>,
    /// Whether the transaction must be read-only.
    pub read_only: Option<bool>,
}

impl TxOptions {
    /// Options with only the isolation level set.
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            isolation: Some(isolation),
            read_only: None,
        }
    }

    /// Read-only options with no isolation preference.
    pub fn read_only() -> Self {
        Self {
            isolation: None,
            read_only: Some(true),
        }
    }

    /// True when neither field is set.
    pub fn is_unset(&self) -> bool {
        self.isolation.is_none() && self.read_only.is_none()
    }

    /// Check whether two option sets can describe the same transaction.
    pub fn is_compatible(&self, other: &TxOptions) -> bool {
        Self::reconcile(self, other).is_some()
    }

    /// Merge the options already in force with the ones a caller asks for.
    ///
    /// Fields set on both sides must be equal, otherwise `None` is returned.
    /// A field set on one side only is adopted.
    pub fn reconcile(committed: &TxOptions, requested: &TxOptions) -> Option<TxOptions> {
        Some(TxOptions {
            isolation: merge_field(committed.isolation, requested.isolation)?,
            read_only: merge_field(committed.read_only, requested.read_only)?,
        })
    }
}

fn merge_field<T: PartialEq>(committed: Option<T>, requested: Option<T>) -> Option<Option<T>> {
    match (committed, requested) {
        (Some(a), Some(b)) if a != b => None,
        (Some(a), _) => Some(Some(a)),
        (None, requested) => Some(requested),
    }
}

impl fmt::Display for TxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.isolation {
            Some(level) => write!(f, "isolation={}", level)?,
            None => write!(f, "isolation=default")?,
        }
        match self.read_only {
            Some(ro) => write!(f, ", read_only={}", ro),
            None => write!(f, ", read_only=default"),
        }
    }
}

/// Options passed by business logic when asking for the request transaction.
///
/// ```
/// use txscope::transaction::{DatabaseOptions, IsolationLevel};
///
/// let opts = DatabaseOptions::read_only_replica()
///     .with_isolation(IsolationLevel::RepeatableRead);
/// assert!(opts.replica_preferred);
/// assert_eq!(opts.tx_options().unwrap().read_only, Some(true));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Requested isolation level; unset leaves it to the database.
    pub isolation: Option<IsolationLevel>,
    /// Requested read-only flag; unset leaves it to the database.
    pub read_only: Option<bool>,
    /// Prefer the read-only replica when one is configured.
    pub replica_preferred: bool,
}

impl DatabaseOptions {
    /// Read-write access on the primary with database defaults.
    pub fn read_write() -> Self {
        Self::default()
    }

    /// Read-only access, served by the replica when one is configured.
    pub fn read_only_replica() -> Self {
        Self {
            isolation: None,
            read_only: Some(true),
            replica_preferred: true,
        }
    }

    /// Set the isolation level.
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Set the read-only flag.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    /// Set whether the replica is preferred.
    pub fn with_replica(mut self, replica_preferred: bool) -> Self {
        self.replica_preferred = replica_preferred;
        self
    }

    /// The transaction options carried by these options, if any field is set.
    pub fn tx_options(&self) -> Option<TxOptions> {
        let opts = TxOptions {
            isolation: self.isolation,
            read_only: self.read_only,
        };
        if opts.is_unset() {
            None
        } else {
            Some(opts)
        }
    }
}

impl From<TxOptions> for DatabaseOptions {
    fn from(opts: TxOptions) -> Self {
        Self {
            isolation: opts.isolation,
            read_only: opts.read_only,
            replica_preferred: false,
        }
    }
}
