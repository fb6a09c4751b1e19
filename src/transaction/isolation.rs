//! Transaction isolation levels.
//!
//! The levels mirror the ones a SQL driver accepts when opening a
//! transaction. A level that is not requested at all is represented by
//! `None` in [`TxOptions`](super::TxOptions), leaving the choice to the
//! database.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Dirty reads are allowed.
    ReadUncommitted,

    /// Each read sees the most recently committed data at the time of the read.
    ReadCommitted,

    /// Writes are only visible once committed; reads may still be stale.
    WriteCommitted,

    /// Rows read once read the same for the remainder of the transaction.
    RepeatableRead,

    /// All reads see a consistent snapshot taken at transaction start.
    Snapshot,

    /// Transactions behave as if executed one after another.
    Serializable,

    /// Serializable, and consistent with real-time ordering.
    Linearizable,
}

impl IsolationLevel {
    /// Check if this isolation level reads from a fixed snapshot.
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead
                | IsolationLevel::Snapshot
                | IsolationLevel::Serializable
                | IsolationLevel::Linearizable
        )
    }

    /// SQL keyword form, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::WriteCommitted => "WRITE COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Snapshot => "SNAPSHOT",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::Linearizable => "LINEARIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['_', '-'], " ").as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "WRITE COMMITTED" => Ok(IsolationLevel::WriteCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SNAPSHOT" => Ok(IsolationLevel::Snapshot),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            "LINEARIZABLE" => Ok(IsolationLevel::Linearizable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}
