//! Request interceptor that scopes a transaction to each unary call.
//!
//! [`TransactionInterceptor`] forks a fresh [`TransactionHandle`] from its
//! template for every call, attaches it to the request context and runs the
//! handler. When the handler returns:
//!
//! - `Ok` commits the transaction. A failed commit becomes an `INTERNAL`
//!   status.
//! - `Err` rolls the transaction back and returns the handler's status.
//! - A panic rolls the transaction back and resumes the panic untouched.
//!
//! Secondary failures during commit or rollback are attached to the returned
//! status as an [`ErrorDetail`], except when the database is unreachable: then
//! an `UNAVAILABLE` status is returned on its own.

mod status;

pub use status::{Code, ErrorDetail, Status, DETAIL_TARGET};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::context::{attach_transaction_handle, RequestContext};
use crate::source::DatabaseSource;
use crate::transaction::TransactionHandle;

/// Information about the call being intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryServerInfo {
    /// Full method name, e.g. `/users.v1.Users/Create`.
    pub full_method: String,
}

impl UnaryServerInfo {
    pub fn new(full_method: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
        }
    }
}

/// A middleware around unary request handlers.
pub trait UnaryInterceptor<Req, Resp> {
    /// Runs `handler` for `req`, possibly with a derived context.
    fn intercept<H>(
        &self,
        ctx: &RequestContext,
        req: Req,
        info: &UnaryServerInfo,
        handler: H,
    ) -> Result<Resp, Status>
    where
        H: FnOnce(RequestContext, Req) -> Result<Resp, Status>;
}

/// Interceptor managing one transaction per request.
///
/// ```
/// use std::sync::Arc;
/// use txscope::context::RequestContext;
/// use txscope::interceptor::{TransactionInterceptor, UnaryInterceptor, UnaryServerInfo};
/// use txscope::source::MemorySource;
/// use txscope::transaction::begin_from_context;
///
/// let db = Arc::new(MemorySource::new("primary"));
/// let interceptor = TransactionInterceptor::new(Arc::clone(&db));
///
/// let info = UnaryServerInfo::new("/users.v1.Users/Create");
/// let resp = interceptor.intercept(&RequestContext::new(), "alice", &info, |ctx, name| {
///     let tx = begin_from_context::<MemorySource>(&ctx)?;
///     tx.execute(&format!("INSERT INTO users VALUES ('{}')", name))
///         .map_err(|e| txscope::interceptor::Status::internal(e.to_string()))?;
///     Ok(name.len())
/// });
///
/// assert_eq!(resp, Ok(5));
/// assert_eq!(db.commits(), 1);
/// ```
pub struct TransactionInterceptor<S: DatabaseSource> {
    template: Arc<TransactionHandle<S>>,
}

impl<S: DatabaseSource> TransactionInterceptor<S> {
    /// Interceptor opening transactions on `primary`.
    pub fn new(primary: Arc<S>) -> Self {
        Self::from_template(TransactionHandle::new(primary))
    }

    /// Interceptor with an optional read-only replica.
    pub fn with_replica(primary: Arc<S>, replica: Option<Arc<S>>) -> Self {
        Self::from_template(TransactionHandle::with_replica(primary, replica))
    }

    /// Interceptor forking its per-request handles from `template`.
    pub fn from_template(template: TransactionHandle<S>) -> Self {
        Self {
            template: Arc::new(template),
        }
    }

    /// The template handle, e.g. to register post-commit hooks at startup.
    pub fn template(&self) -> &TransactionHandle<S> {
        &self.template
    }

    fn finish<Resp>(
        &self,
        txn: &TransactionHandle<S>,
        ctx: &RequestContext,
        info: &UnaryServerInfo,
        result: Result<Resp, Status>,
    ) -> Result<Resp, Status> {
        let (status, err) = match result {
            Ok(resp) => match txn.commit(ctx) {
                Ok(()) => return Ok(resp),
                Err(err) => (Status::internal("failed to commit transaction"), err),
            },
            Err(status) => match txn.rollback() {
                Ok(()) => return Err(status),
                Err(err) => (status, err),
            },
        };

        warn!(
            method = %info.full_method,
            request_id = ctx.request_id(),
            handle = txn.id(),
            error = %err,
            "failed to finish request transaction"
        );

        if err.is_unavailable() {
            return Err(Status::from(err));
        }
        Err(status.with_detail(ErrorDetail::new(
            Code::Internal,
            DETAIL_TARGET,
            err.to_string(),
        )))
    }
}

impl<S: DatabaseSource> Clone for TransactionInterceptor<S> {
    fn clone(&self) -> Self {
        Self {
            template: Arc::clone(&self.template),
        }
    }
}

impl<S, Req, Resp> UnaryInterceptor<Req, Resp> for TransactionInterceptor<S>
where
    S: DatabaseSource,
{
    fn intercept<H>(
        &self,
        ctx: &RequestContext,
        req: Req,
        info: &UnaryServerInfo,
        handler: H,
    ) -> Result<Resp, Status>
    where
        H: FnOnce(RequestContext, Req) -> Result<Resp, Status>,
    {
        let txn = Arc::new(self.template.fork());
        let scoped = attach_transaction_handle(ctx, Arc::clone(&txn));

        let result = match panic::catch_unwind(AssertUnwindSafe(|| handler(scoped, req))) {
            Ok(result) => result,
            Err(payload) => {
                if let Err(err) = txn.rollback() {
                    warn!(
                        method = %info.full_method,
                        request_id = ctx.request_id(),
                        error = %err,
                        "rollback after handler panic failed"
                    );
                }
                panic::resume_unwind(payload);
            }
        };

        self.finish(&txn, ctx, info, result)
    }
}
