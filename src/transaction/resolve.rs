//! Resolving the request transaction from the context.
//!
//! This is the entry point for business logic: call
//! [`resolve_transaction`] as often as needed while handling a request, and
//! the same underlying transaction comes back every time. Contradictory
//! requests (a writer after a reader, different isolation levels) fail fast
//! instead of being merged.

use std::sync::Arc;

use crate::context::{extract_transaction_handle, RequestContext};
use crate::source::DatabaseSource;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::handle::SourceKind;
use crate::transaction::options::DatabaseOptions;

/// Return the request's transaction, beginning it on first use.
///
/// With `options.replica_preferred` the transaction is opened on the
/// read-only replica when the handle has one, and on the primary otherwise.
///
/// # Errors
///
/// - [`TransactionError::Missing`] if no handle is attached to `ctx`.
/// - [`TransactionError::KindMismatch`] if the request is already bound to
///   the other database. Asking for a reader after a writer only fails when a
///   replica exists; without one the writer is reused.
/// - [`TransactionError::OptionsMismatch`] if `options` contradict the options
///   already in force.
/// - [`TransactionError::NoDatabase`] and [`TransactionError::Begin`] from
///   opening the transaction.
pub fn resolve_transaction<S: DatabaseSource>(
    ctx: &RequestContext,
    options: &DatabaseOptions,
) -> TransactionResult<Arc<S::Transaction>> {
    let handle = extract_transaction_handle::<S>(ctx).ok_or(TransactionError::Missing)?;
    let tx_options = options.tx_options();

    let mut state = handle.lock();
    if options.replica_preferred {
        if state.kind == SourceKind::ReadWrite && handle.has_replica() {
            return Err(TransactionError::KindMismatch {
                requested: SourceKind::ReadOnly,
                bound: SourceKind::ReadWrite,
            });
        }
        handle.read_only_locked(&mut state, ctx, tx_options.as_ref())
    } else {
        if state.kind == SourceKind::ReadOnly {
            return Err(TransactionError::KindMismatch {
                requested: SourceKind::ReadWrite,
                bound: SourceKind::ReadOnly,
            });
        }
        handle.read_write_locked(&mut state, ctx, tx_options.as_ref())
    }
}

/// Return the request's read-write transaction with database defaults.
pub fn begin_from_context<S: DatabaseSource>(
    ctx: &RequestContext,
) -> TransactionResult<Arc<S::Transaction>> {
    resolve_transaction::<S>(ctx, &DatabaseOptions::read_write())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::attach_transaction_handle;
    use crate::source::{MemorySource, MemoryTransaction};
    use crate::transaction::handle::TransactionHandle;
    use crate::transaction::isolation::IsolationLevel;
    use crate::transaction::options::TxOptions;

    struct Fixture {
        db: Arc<MemorySource>,
        ro: Option<Arc<MemorySource>>,
        ctx: RequestContext,
    }

    fn setup(with_replica: bool) -> Fixture {
        let db = Arc::new(MemorySource::new("primary"));
        let ro = with_replica.then(|| Arc::new(MemorySource::new("replica")));
        let handle = Arc::new(TransactionHandle::with_replica(Arc::clone(&db), ro.clone()));
        let ctx = attach_transaction_handle(&RequestContext::new(), handle);
        Fixture { db, ro, ctx }
    }

    fn resolve(ctx: &RequestContext, opts: DatabaseOptions) -> TransactionResult<Arc<MemoryTransaction>> {
        resolve_transaction::<MemorySource>(ctx, &opts)
    }

    #[test]
    fn test_missing_handle() {
        let err = resolve(&RequestContext::new(), DatabaseOptions::default()).unwrap_err();
        assert!(matches!(err, TransactionError::Missing));
    }

    #[test]
    fn test_repeated_calls_reuse_transaction() {
        let f = setup(false);
        let opts = DatabaseOptions::read_write().with_isolation(IsolationLevel::RepeatableRead);

        let tx1 = resolve(&f.ctx, opts).unwrap();
        let tx2 = resolve(&f.ctx, opts).unwrap();
        let tx3 = begin_from_context::<MemorySource>(&f.ctx).unwrap();

        assert!(Arc::ptr_eq(&tx1, &tx2));
        assert!(Arc::ptr_eq(&tx1, &tx3));
        assert_eq!(f.db.begins(), 1);
    }

    #[test]
    fn test_reader_after_writer_with_replica_fails() {
        let f = setup(true);
        resolve(&f.ctx, DatabaseOptions::read_write()).unwrap();

        let err = resolve(&f.ctx, DatabaseOptions::read_only_replica()).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::KindMismatch {
                requested: SourceKind::ReadOnly,
                bound: SourceKind::ReadWrite,
            }
        ));
        assert_eq!(f.ro.unwrap().begins(), 0);
    }

    #[test]
    fn test_reader_after_writer_without_replica_reuses_writer() {
        let f = setup(false);
        let writer = resolve(&f.ctx, DatabaseOptions::read_write()).unwrap();
        let reader = resolve(&f.ctx, DatabaseOptions::default().with_replica(true)).unwrap();

        assert!(Arc::ptr_eq(&writer, &reader));
        assert_eq!(f.db.begins(), 1);
    }

    #[test]
    fn test_writer_after_reader_fails() {
        let f = setup(true);
        let reader = resolve(&f.ctx, DatabaseOptions::read_only_replica()).unwrap();
        assert_eq!(reader.source_name(), "replica");

        let err = resolve(&f.ctx, DatabaseOptions::read_write()).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::KindMismatch {
                requested: SourceKind::ReadWrite,
                bound: SourceKind::ReadOnly,
            }
        ));
        assert_eq!(f.db.begins(), 0);
    }

    #[test]
    fn test_repeated_readers_share_replica_transaction() {
        let f = setup(true);
        let opts = DatabaseOptions::read_only_replica();
        let tx1 = resolve(&f.ctx, opts).unwrap();
        let tx2 = resolve(&f.ctx, opts.with_isolation(IsolationLevel::Snapshot)).unwrap();

        assert!(Arc::ptr_eq(&tx1, &tx2));
        let ro = f.ro.unwrap();
        assert_eq!(ro.begins(), 1);
        assert_eq!(ro.begun_with(), vec![Some(TxOptions::read_only())]);
    }

    #[test]
    fn test_isolation_conflict() {
        let f = setup(false);
        resolve(
            &f.ctx,
            DatabaseOptions::read_write().with_isolation(IsolationLevel::ReadCommitted),
        )
        .unwrap();

        let err = resolve(
            &f.ctx,
            DatabaseOptions::read_write().with_isolation(IsolationLevel::Serializable),
        )
        .unwrap_err();
        assert!(matches!(err, TransactionError::OptionsMismatch { .. }));
        assert!(err.is_mismatch());
    }

    #[test]
    fn test_read_only_flag_conflict() {
        let f = setup(false);
        resolve(&f.ctx, DatabaseOptions::read_write().with_read_only(false)).unwrap();

        let err = resolve(&f.ctx, DatabaseOptions::read_write().with_read_only(true)).unwrap_err();
        assert!(matches!(err, TransactionError::OptionsMismatch { .. }));
    }

    #[test]
    fn test_handle_for_other_source_is_missing() {
        struct OtherSource;
        impl DatabaseSource for OtherSource {
            type Transaction = MemoryTransaction;
            fn begin_transaction(
                &self,
                ctx: &RequestContext,
                options: Option<&TxOptions>,
            ) -> crate::source::SourceResult<MemoryTransaction> {
                MemorySource::new("other").begin_transaction(ctx, options)
            }
        }

        let f = setup(false);
        let err = resolve_transaction::<OtherSource>(&f.ctx, &DatabaseOptions::default()).unwrap_err();
        assert!(matches!(err, TransactionError::Missing));
    }

    #[test]
    fn test_concurrent_resolve_single_transaction() {
        let f = setup(true);

        let txs: Vec<_> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| resolve(&f.ctx, DatabaseOptions::read_write()).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(f.db.begins(), 1);
        assert!(txs.iter().all(|tx| Arc::ptr_eq(tx, &txs[0])));
    }
}
