//! Per-request transaction handle.
//!
//! A [`TransactionHandle`] wraps the database sources available to a request
//! and works as a singleton: however many times the request asks for a
//! transaction, at most one underlying transaction is open at a time.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::context::RequestContext;
use crate::source::{DatabaseSource, SourceTransaction};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::options::TxOptions;

/// Callback run after a successful commit.
pub type PostCommitHook = Arc<dyn Fn(&RequestContext) + Send + Sync>;

/// Which database the request's transaction was opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// No transaction has been opened yet.
    #[default]
    Unset,
    /// Opened on the read-only replica.
    ReadOnly,
    /// Opened on the primary.
    ReadWrite,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Unset => write!(f, "unset"),
            SourceKind::ReadOnly => write!(f, "read-only"),
            SourceKind::ReadWrite => write!(f, "read-write"),
        }
    }
}

pub(crate) struct HandleState<S: DatabaseSource> {
    pub(crate) current: Option<Arc<S::Transaction>>,
    pub(crate) tx_options: Option<TxOptions>,
    pub(crate) kind: SourceKind,
    hooks: Vec<PostCommitHook>,
}

impl<S: DatabaseSource> HandleState<S> {
    fn new(hooks: Vec<PostCommitHook>) -> Self {
        Self {
            current: None,
            tx_options: None,
            kind: SourceKind::Unset,
            hooks,
        }
    }
}

/// Transaction handle for one request.
///
/// The interceptor keeps a long-lived template handle holding the sources and
/// post-commit hooks, and [`fork`](TransactionHandle::fork)s a fresh handle
/// for every request. Business logic reaches the handle through the request
/// context.
///
/// All operations take the handle's lock for the whole check-and-act
/// sequence, so concurrent callers within one request never open two
/// transactions.
pub struct TransactionHandle<S: DatabaseSource> {
    id: String,
    primary: Option<Arc<S>>,
    replica: Option<Arc<S>>,
    state: Mutex<HandleState<S>>,
}

impl<S: DatabaseSource> TransactionHandle<S> {
    /// Create a handle that opens transactions on `primary`.
    pub fn new(primary: Arc<S>) -> Self {
        Self::with_replica(primary, None)
    }

    /// Create a handle with an optional read-only replica.
    pub fn with_replica(primary: Arc<S>, replica: Option<Arc<S>>) -> Self {
        Self::from_parts(Some(primary), replica, Vec::new())
    }

    /// Create a handle with no database at all.
    ///
    /// Every begin fails with [`TransactionError::NoDatabase`].
    pub fn detached() -> Self {
        Self::from_parts(None, None, Vec::new())
    }

    fn from_parts(
        primary: Option<Arc<S>>,
        replica: Option<Arc<S>>,
        hooks: Vec<PostCommitHook>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            primary,
            replica,
            state: Mutex::new(HandleState::new(hooks)),
        }
    }

    /// Create a fresh handle for a new request.
    ///
    /// Sources and post-commit hooks are shared with `self`; the transaction
    /// state starts empty.
    pub fn fork(&self) -> Self {
        let hooks = self.state.lock().hooks.clone();
        Self::from_parts(self.primary.clone(), self.replica.clone(), hooks)
    }

    /// Handle id, used in log events.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check if a read-only replica is configured.
    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    /// Which database the request is bound to.
    pub fn source_kind(&self) -> SourceKind {
        self.state.lock().kind
    }

    /// Options in force for the request's transaction.
    pub fn committed_options(&self) -> Option<TxOptions> {
        self.state.lock().tx_options
    }

    /// Check if a transaction is open.
    pub fn is_active(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// Register callbacks to run, in order, after a successful commit.
    ///
    /// Hooks run while the handle is locked and must not begin, commit or
    /// roll back on the same handle.
    pub fn add_post_commit_hooks<I>(&self, hooks: I)
    where
        I: IntoIterator<Item = PostCommitHook>,
    {
        self.state.lock().hooks.extend(hooks);
    }

    /// Register a single post-commit callback.
    pub fn add_post_commit_hook<F>(&self, hook: F)
    where
        F: Fn(&RequestContext) + Send + Sync + 'static,
    {
        self.add_post_commit_hooks([Arc::new(hook) as PostCommitHook]);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HandleState<S>> {
        self.state.lock()
    }

    /// Begin a transaction on the primary without options.
    pub fn begin(&self, ctx: &RequestContext) -> TransactionResult<Arc<S::Transaction>> {
        self.begin_read_write(ctx, None)
    }

    /// Begin a transaction on the primary with explicit options.
    pub fn begin_with_options(
        &self,
        ctx: &RequestContext,
        options: &TxOptions,
    ) -> TransactionResult<Arc<S::Transaction>> {
        self.begin_read_write(ctx, Some(options))
    }

    /// Return the open transaction, or begin one on the primary.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::NoDatabase`] if the handle has no primary.
    /// - [`TransactionError::OptionsMismatch`] if `options` contradict the
    ///   options already in force.
    /// - [`TransactionError::Begin`] if the database refused to begin.
    pub fn begin_read_write(
        &self,
        ctx: &RequestContext,
        options: Option<&TxOptions>,
    ) -> TransactionResult<Arc<S::Transaction>> {
        let mut state = self.lock();
        self.read_write_locked(&mut state, ctx, options)
    }

    /// Return the open transaction, or begin one on the replica.
    ///
    /// Without a replica this is [`begin_read_write`](Self::begin_read_write).
    pub fn begin_read_only(
        &self,
        ctx: &RequestContext,
        options: Option<&TxOptions>,
    ) -> TransactionResult<Arc<S::Transaction>> {
        let mut state = self.lock();
        self.read_only_locked(&mut state, ctx, options)
    }

    pub(crate) fn read_write_locked(
        &self,
        state: &mut HandleState<S>,
        ctx: &RequestContext,
        options: Option<&TxOptions>,
    ) -> TransactionResult<Arc<S::Transaction>> {
        let Some(primary) = self.primary.as_ref() else {
            return Err(TransactionError::NoDatabase);
        };
        let merged = reconcile(state.tx_options, options)?;
        self.current_or_begin(state, ctx, primary, merged, SourceKind::ReadWrite)
    }

    pub(crate) fn read_only_locked(
        &self,
        state: &mut HandleState<S>,
        ctx: &RequestContext,
        options: Option<&TxOptions>,
    ) -> TransactionResult<Arc<S::Transaction>> {
        let Some(replica) = self.replica.as_ref() else {
            return self.read_write_locked(state, ctx, options);
        };
        // A replica transaction cannot be asked to write.
        if options.and_then(|o| o.read_only) == Some(false) {
            return Err(TransactionError::options_mismatch(
                options.copied(),
                state.tx_options,
            ));
        }
        let merged = reconcile(state.tx_options, options)?;
        self.current_or_begin(state, ctx, replica, merged, SourceKind::ReadOnly)
    }

    fn current_or_begin(
        &self,
        state: &mut HandleState<S>,
        ctx: &RequestContext,
        source: &Arc<S>,
        options: Option<TxOptions>,
        kind: SourceKind,
    ) -> TransactionResult<Arc<S::Transaction>> {
        if let Some(current) = state.current.as_ref() {
            let current = Arc::clone(current);
            state.tx_options = options;
            return Ok(current);
        }

        let tx = source
            .begin_transaction(ctx, options.as_ref())
            .map_err(TransactionError::Begin)?;
        let tx = Arc::new(tx);

        state.current = Some(Arc::clone(&tx));
        state.tx_options = options;
        if state.kind == SourceKind::Unset {
            state.kind = kind;
        }
        debug!(
            handle = %self.id,
            request_id = ctx.request_id(),
            kind = %kind,
            "began transaction"
        );
        Ok(tx)
    }

    /// Roll back the open transaction.
    ///
    /// Does nothing if no transaction is open. If the connection is gone the
    /// transaction is left in place and
    /// [`TransactionError::ConnectionUnavailable`] is returned.
    pub fn rollback(&self) -> TransactionResult<()> {
        let mut state = self.lock();
        let Some(tx) = state.current.as_ref() else {
            return Ok(());
        };
        if !tx.is_connected() {
            warn!(handle = %self.id, "cannot roll back, database connection not available");
            return Err(TransactionError::ConnectionUnavailable);
        }

        let result = tx.rollback();
        state.current = None;
        debug!(handle = %self.id, ok = result.is_ok(), "rolled back transaction");
        result.map_err(TransactionError::Rollback)
    }

    /// Commit the open transaction and run the post-commit hooks.
    ///
    /// Does nothing if no transaction is open or its connection is gone.
    /// Hooks run only when the commit succeeded; the transaction is cleared
    /// either way.
    pub fn commit(&self, ctx: &RequestContext) -> TransactionResult<()> {
        let mut state = self.lock();
        let tx = match state.current.as_ref() {
            Some(tx) if tx.is_connected() => Arc::clone(tx),
            _ => return Ok(()),
        };

        let result = tx.commit();
        state.current = None;
        debug!(
            handle = %self.id,
            request_id = ctx.request_id(),
            ok = result.is_ok(),
            "committed transaction"
        );
        result.map_err(TransactionError::Commit)?;

        for hook in &state.hooks {
            hook(ctx);
        }
        Ok(())
    }
}

fn reconcile(
    committed: Option<TxOptions>,
    requested: Option<&TxOptions>,
) -> TransactionResult<Option<TxOptions>> {
    let Some(requested) = requested else {
        return Ok(committed);
    };
    TxOptions::reconcile(&committed.unwrap_or_default(), requested)
        .map(Some)
        .ok_or_else(|| TransactionError::options_mismatch(Some(*requested), committed))
}

impl<S: DatabaseSource> fmt::Debug for TransactionHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("has_primary", &self.primary.is_some())
            .field("has_replica", &self.replica.is_some())
            .field("active", &state.current.is_some())
            .field("kind", &state.kind)
            .field("tx_options", &state.tx_options)
            .field("hooks", &state.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, SourceError, TxOutcome};
    use crate::transaction::isolation::IsolationLevel;

    fn setup() -> (Arc<MemorySource>, TransactionHandle<MemorySource>) {
        let db = Arc::new(MemorySource::new("primary"));
        let handle = TransactionHandle::new(Arc::clone(&db));
        (db, handle)
    }

    fn setup_with_replica() -> (
        Arc<MemorySource>,
        Arc<MemorySource>,
        TransactionHandle<MemorySource>,
    ) {
        let db = Arc::new(MemorySource::new("primary"));
        let ro = Arc::new(MemorySource::new("replica"));
        let handle = TransactionHandle::with_replica(Arc::clone(&db), Some(Arc::clone(&ro)));
        (db, ro, handle)
    }

    #[test]
    fn test_begin_is_idempotent() {
        let (db, handle) = setup();
        let ctx = RequestContext::new();

        let tx1 = handle.begin(&ctx).unwrap();
        let tx2 = handle.begin_read_write(&ctx, None).unwrap();
        assert!(Arc::ptr_eq(&tx1, &tx2));
        assert_eq!(db.begins(), 1);
        assert_eq!(handle.source_kind(), SourceKind::ReadWrite);
        assert!(handle.is_active());
    }

    #[test]
    fn test_begin_without_database() {
        let handle = TransactionHandle::<MemorySource>::detached();
        let err = handle.begin(&RequestContext::new()).unwrap_err();
        assert!(matches!(err, TransactionError::NoDatabase));
        assert_eq!(handle.source_kind(), SourceKind::Unset);
    }

    #[test]
    fn test_read_only_without_replica_uses_primary() {
        let (db, handle) = setup();
        let tx = handle
            .begin_read_only(&RequestContext::new(), Some(&TxOptions::read_only()))
            .unwrap();
        assert_eq!(tx.source_name(), "primary");
        assert_eq!(db.begins(), 1);
        assert_eq!(handle.source_kind(), SourceKind::ReadWrite);
    }

    #[test]
    fn test_read_only_uses_replica() {
        let (db, ro, handle) = setup_with_replica();
        let tx = handle.begin_read_only(&RequestContext::new(), None).unwrap();
        assert_eq!(tx.source_name(), "replica");
        assert_eq!(db.begins(), 0);
        assert_eq!(ro.begins(), 1);
        assert_eq!(handle.source_kind(), SourceKind::ReadOnly);
    }

    #[test]
    fn test_replica_rejects_read_write_options() {
        let (_db, ro, handle) = setup_with_replica();
        let opts = TxOptions {
            isolation: None,
            read_only: Some(false),
        };
        let err = handle
            .begin_read_only(&RequestContext::new(), Some(&opts))
            .unwrap_err();
        assert!(matches!(err, TransactionError::OptionsMismatch { .. }));
        assert_eq!(ro.begins(), 0);
    }

    #[test]
    fn test_options_adopted_then_enforced() {
        let (db, handle) = setup();
        let ctx = RequestContext::new();
        let serializable = TxOptions::with_isolation(IsolationLevel::Serializable);

        handle.begin_with_options(&ctx, &serializable).unwrap();
        assert_eq!(handle.committed_options(), Some(serializable));
        assert_eq!(db.begun_with(), vec![Some(serializable)]);

        // Unset options are compatible with anything in force.
        handle.begin(&ctx).unwrap();

        let read_committed = TxOptions::with_isolation(IsolationLevel::ReadCommitted);
        let err = handle.begin_with_options(&ctx, &read_committed).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::OptionsMismatch {
                requested: Some(_),
                committed: Some(_),
            }
        ));
        assert_eq!(db.begins(), 1);
    }

    #[test]
    fn test_failed_begin_records_nothing() {
        let (db, handle) = setup();
        let ctx = RequestContext::new();
        db.fail_begin(SourceError::Unavailable("pool exhausted".into()));

        let opts = TxOptions::with_isolation(IsolationLevel::Snapshot);
        let err = handle.begin_with_options(&ctx, &opts).unwrap_err();
        assert!(err.is_unavailable());
        assert!(!handle.is_active());
        assert_eq!(handle.source_kind(), SourceKind::Unset);
        assert_eq!(handle.committed_options(), None);

        db.heal();
        let other = TxOptions::with_isolation(IsolationLevel::ReadCommitted);
        handle.begin_with_options(&ctx, &other).unwrap();
        assert_eq!(handle.committed_options(), Some(other));
    }

    #[test]
    fn test_rollback_without_transaction() {
        let (db, handle) = setup();
        handle.rollback().unwrap();
        assert_eq!(db.rollbacks(), 0);
    }

    #[test]
    fn test_rollback() {
        let (db, handle) = setup();
        let tx = handle.begin(&RequestContext::new()).unwrap();
        tx.execute("INSERT INTO users VALUES (1)").unwrap();

        handle.rollback().unwrap();
        assert!(!handle.is_active());
        assert_eq!(tx.outcome(), TxOutcome::RolledBack);
        assert_eq!(db.rollbacks(), 1);
        assert!(db.committed_statements().is_empty());
    }

    #[test]
    fn test_rollback_connection_unavailable() {
        let (db, handle) = setup();
        let tx = handle.begin(&RequestContext::new()).unwrap();
        tx.disconnect();

        let err = handle.rollback().unwrap_err();
        assert!(matches!(err, TransactionError::ConnectionUnavailable));
        assert!(handle.is_active());
        assert_eq!(db.rollbacks(), 0);
    }

    #[test]
    fn test_rollback_error_clears_transaction() {
        let (db, handle) = setup();
        handle.begin(&RequestContext::new()).unwrap();
        db.fail_rollback(SourceError::Database("broken pipe".into()));

        let err = handle.rollback().unwrap_err();
        assert!(matches!(err, TransactionError::Rollback(_)));
        assert!(!handle.is_active());
    }

    #[test]
    fn test_commit_without_transaction() {
        let (db, handle) = setup();
        let called = Arc::new(Mutex::new(0));
        let c = Arc::clone(&called);
        handle.add_post_commit_hook(move |_| *c.lock() += 1);

        handle.commit(&RequestContext::new()).unwrap();
        assert_eq!(db.commits(), 0);
        assert_eq!(*called.lock(), 0);
    }

    #[test]
    fn test_commit_runs_hooks_in_order() {
        let (db, handle) = setup();
        let ctx = RequestContext::with_request_id("req-42");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            handle.add_post_commit_hook(move |ctx| {
                seen.lock().push(format!("{}:{}", name, ctx.request_id()));
            });
        }

        let tx = handle.begin(&ctx).unwrap();
        tx.execute("INSERT INTO users VALUES (1)").unwrap();
        handle.commit(&ctx).unwrap();

        assert_eq!(
            *seen.lock(),
            vec!["first:req-42", "second:req-42", "third:req-42"]
        );
        assert_eq!(db.commits(), 1);
        assert_eq!(db.committed_statements().len(), 1);
        assert!(!handle.is_active());
    }

    #[test]
    fn test_commit_failure_skips_hooks() {
        let (db, handle) = setup();
        let ctx = RequestContext::new();
        let called = Arc::new(Mutex::new(false));
        let c = Arc::clone(&called);
        handle.add_post_commit_hook(move |_| *c.lock() = true);

        handle.begin(&ctx).unwrap();
        db.fail_commit(SourceError::Database("serialization failure".into()));

        let err = handle.commit(&ctx).unwrap_err();
        assert!(matches!(err, TransactionError::Commit(_)));
        assert!(!handle.is_active());
        assert!(!*called.lock());
    }

    #[test]
    fn test_commit_with_lost_connection_is_noop() {
        let (db, handle) = setup();
        let tx = handle.begin(&RequestContext::new()).unwrap();
        tx.disconnect();

        handle.commit(&RequestContext::new()).unwrap();
        assert_eq!(db.commits(), 0);
        assert!(handle.is_active());
    }

    #[test]
    fn test_fork_shares_hooks_not_state() {
        let (db, template) = setup();
        let called = Arc::new(Mutex::new(0));
        let c = Arc::clone(&called);
        template.add_post_commit_hook(move |_| *c.lock() += 1);

        let ctx = RequestContext::new();
        let first = template.fork();
        first.begin(&ctx).unwrap();
        assert!(!template.is_active());

        let second = template.fork();
        assert!(!second.is_active());
        assert_eq!(second.source_kind(), SourceKind::Unset);
        assert_ne!(first.id(), second.id());

        first.commit(&ctx).unwrap();
        second.begin(&ctx).unwrap();
        second.commit(&ctx).unwrap();
        assert_eq!(*called.lock(), 2);
        assert_eq!(db.begins(), 2);
    }

    #[test]
    fn test_concurrent_begin_opens_one_transaction() {
        let (db, handle) = setup();
        let ctx = RequestContext::new();

        let txs: Vec<_> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| handle.begin(&ctx).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(db.begins(), 1);
        assert!(txs.iter().all(|tx| Arc::ptr_eq(tx, &txs[0])));
    }
}
