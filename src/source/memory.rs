//! In-memory database source for testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ulid::Ulid;

use crate::context::RequestContext;
use crate::source::{DatabaseSource, SourceError, SourceResult, SourceTransaction};
use crate::transaction::TxOptions;

/// How a [`MemoryTransaction`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug, Default)]
struct Counters {
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

#[derive(Debug, Default)]
struct Faults {
    begin: Option<SourceError>,
    commit: Option<SourceError>,
    rollback: Option<SourceError>,
    disconnected: bool,
}

#[derive(Debug)]
struct Shared {
    name: String,
    counters: Mutex<Counters>,
    faults: Mutex<Faults>,
    /// Statements of committed transactions, in commit order.
    committed: Mutex<Vec<String>>,
    /// Options of every transaction begun, in begin order.
    begun_with: Mutex<Vec<Option<TxOptions>>>,
}

/// An in-memory database source.
///
/// Transactions buffer the statements passed to
/// [`MemoryTransaction::execute`] and publish them to the source on commit.
/// Begin, commit and rollback are counted, and each of them can be made to
/// fail, which is what most tests of the coordinator need.
///
/// # Example
///
/// ```rust
/// use txscope::context::RequestContext;
/// use txscope::source::{DatabaseSource, MemorySource, SourceTransaction};
///
/// let db = MemorySource::new("primary");
/// let tx = db.begin_transaction(&RequestContext::new(), None).unwrap();
/// tx.execute("INSERT INTO users VALUES (1)").unwrap();
/// tx.commit().unwrap();
/// assert_eq!(db.committed_statements(), vec!["INSERT INTO users VALUES (1)"]);
/// ```
#[derive(Debug, Clone)]
pub struct MemorySource {
    shared: Arc<Shared>,
}

impl MemorySource {
    /// Creates a new source; the name shows up in transaction ids.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                counters: Mutex::new(Counters::default()),
                faults: Mutex::new(Faults::default()),
                committed: Mutex::new(Vec::new()),
                begun_with: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Name of the source.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of transactions begun.
    pub fn begins(&self) -> usize {
        self.shared.counters.lock().begins
    }

    /// Number of commits issued, successful or not.
    pub fn commits(&self) -> usize {
        self.shared.counters.lock().commits
    }

    /// Number of rollbacks issued, successful or not.
    pub fn rollbacks(&self) -> usize {
        self.shared.counters.lock().rollbacks
    }

    /// Statements made durable by committed transactions.
    pub fn committed_statements(&self) -> Vec<String> {
        self.shared.committed.lock().clone()
    }

    /// Options each transaction was begun with.
    pub fn begun_with(&self) -> Vec<Option<TxOptions>> {
        self.shared.begun_with.lock().clone()
    }

    /// Makes every following begin fail with `err`.
    pub fn fail_begin(&self, err: SourceError) {
        self.shared.faults.lock().begin = Some(err);
    }

    /// Makes every following commit fail with `err`.
    pub fn fail_commit(&self, err: SourceError) {
        self.shared.faults.lock().commit = Some(err);
    }

    /// Makes every following rollback fail with `err`.
    pub fn fail_rollback(&self, err: SourceError) {
        self.shared.faults.lock().rollback = Some(err);
    }

    /// Hands out transactions whose connection is already gone.
    pub fn disconnect(&self) {
        self.shared.faults.lock().disconnected = true;
    }

    /// Clears all injected failures.
    pub fn heal(&self) {
        *self.shared.faults.lock() = Faults::default();
    }
}

impl DatabaseSource for MemorySource {
    type Transaction = MemoryTransaction;

    fn begin_transaction(
        &self,
        ctx: &RequestContext,
        options: Option<&TxOptions>,
    ) -> SourceResult<MemoryTransaction> {
        let faults = self.shared.faults.lock();
        if let Some(err) = faults.begin.clone() {
            return Err(err);
        }
        if ctx.is_expired() {
            return Err(SourceError::Database("request deadline exceeded".into()));
        }

        self.shared.counters.lock().begins += 1;
        self.shared.begun_with.lock().push(options.copied());

        Ok(MemoryTransaction {
            id: format!("{}/{}", self.shared.name, Ulid::new().to_string().to_lowercase()),
            options: options.copied(),
            connected: AtomicBool::new(!faults.disconnected),
            state: Mutex::new(TxState {
                outcome: TxOutcome::Open,
                statements: Vec::new(),
            }),
            shared: Arc::clone(&self.shared),
        })
    }
}

#[derive(Debug)]
struct TxState {
    outcome: TxOutcome,
    statements: Vec<String>,
}

/// A transaction opened by a [`MemorySource`].
#[derive(Debug)]
pub struct MemoryTransaction {
    id: String,
    options: Option<TxOptions>,
    connected: AtomicBool,
    state: Mutex<TxState>,
    shared: Arc<Shared>,
}

impl MemoryTransaction {
    /// Transaction id, prefixed with the source name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the source this transaction was opened on.
    pub fn source_name(&self) -> &str {
        &self.shared.name
    }

    /// Options the transaction was opened with.
    pub fn options(&self) -> Option<TxOptions> {
        self.options
    }

    /// Current outcome.
    pub fn outcome(&self) -> TxOutcome {
        self.state.lock().outcome
    }

    /// Buffers a statement until commit.
    pub fn execute(&self, statement: &str) -> SourceResult<()> {
        if !self.is_connected() {
            return Err(SourceError::Unavailable("connection closed".into()));
        }
        let mut state = self.state.lock();
        if state.outcome != TxOutcome::Open {
            return Err(SourceError::Database(format!(
                "transaction {} is already finished",
                self.id
            )));
        }
        if self.options.and_then(|o| o.read_only) == Some(true) {
            return Err(SourceError::Database(
                "cannot execute statement in a read-only transaction".into(),
            ));
        }
        state.statements.push(statement.to_string());
        Ok(())
    }

    /// Drops the connection, as a pool would after a network failure.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl SourceTransaction for MemoryTransaction {
    fn commit(&self) -> SourceResult<()> {
        self.shared.counters.lock().commits += 1;
        if let Some(err) = self.shared.faults.lock().commit.clone() {
            return Err(err);
        }

        let mut state = self.state.lock();
        if state.outcome != TxOutcome::Open {
            return Err(SourceError::Database(format!(
                "transaction {} is already finished",
                self.id
            )));
        }
        state.outcome = TxOutcome::Committed;
        self.shared
            .committed
            .lock()
            .extend(state.statements.drain(..));
        Ok(())
    }

    fn rollback(&self) -> SourceResult<()> {
        self.shared.counters.lock().rollbacks += 1;
        if let Some(err) = self.shared.faults.lock().rollback.clone() {
            return Err(err);
        }

        let mut state = self.state.lock();
        state.outcome = TxOutcome::RolledBack;
        state.statements.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
