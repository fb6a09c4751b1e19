//! Request-scoped context.
//!
//! A [`RequestContext`] is created for every inbound call and threaded
//! through the handler and everything it calls. It is immutable: attaching a
//! transaction handle produces a child context and leaves the parent as it
//! was. The transaction slot holds at most one handle.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::source::DatabaseSource;
use crate::transaction::TransactionHandle;

/// Context of one inbound request.
#[derive(Clone)]
pub struct RequestContext {
    request_id: String,
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
    txn: Option<Arc<dyn Any + Send + Sync>>,
}

impl RequestContext {
    /// Creates a root context with a fresh request id.
    pub fn new() -> Self {
        Self::with_request_id(Ulid::new().to_string().to_lowercase())
    }

    /// Creates a root context with a caller-supplied request id.
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            started_at: Utc::now(),
            deadline: None,
            txn: None,
        }
    }

    /// Returns a child context that expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Returns a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// When the request started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Check if a transaction handle is attached.
    pub fn has_transaction(&self) -> bool {
        self.txn.is_some()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("started_at", &self.started_at)
            .field("deadline", &self.deadline)
            .field("has_transaction", &self.txn.is_some())
            .finish()
    }
}

/// Returns a child of `parent` carrying `handle`.
///
/// A handle already attached to `parent` is replaced in the child only.
pub fn attach_transaction_handle<S: DatabaseSource>(
    parent: &RequestContext,
    handle: Arc<TransactionHandle<S>>,
) -> RequestContext {
    RequestContext {
        txn: Some(handle as Arc<dyn Any + Send + Sync>),
        ..parent.clone()
    }
}

/// Returns the handle attached to `ctx`, if any.
///
/// A handle attached for a different source type is not returned.
pub fn extract_transaction_handle<S: DatabaseSource>(
    ctx: &RequestContext,
) -> Option<Arc<TransactionHandle<S>>> {
    let txn = ctx.txn.clone()?;
    txn.downcast::<TransactionHandle<S>>().ok()
}
