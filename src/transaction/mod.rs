//! Per-request transaction management.
//!
//! Every inbound request gets its own [`TransactionHandle`]. The handle is
//! lazy: nothing is opened until business logic first calls
//! [`resolve_transaction`], and every later call within the same request gets
//! the same underlying transaction back. At the end of the request the
//! interceptor commits or rolls back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionInterceptor                     │
//! │   (forks a handle per request, commits or rolls back)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                     ┌─────────────────┐
//!                     │ RequestContext  │
//!                     └─────────────────┘
//!                              │
//!                              ▼
//!  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐
//!  │ resolve_        │─▶│ Transaction     │─▶│ DatabaseSource  │
//!  │ transaction     │  │ Handle          │  │ (primary/replica)│
//!  └─────────────────┘  └─────────────────┘  └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use txscope::context::{attach_transaction_handle, RequestContext};
//! use txscope::source::MemorySource;
//! use txscope::transaction::{resolve_transaction, DatabaseOptions, TransactionHandle};
//!
//! let handle = Arc::new(TransactionHandle::new(Arc::new(MemorySource::new("primary"))));
//! let ctx = attach_transaction_handle(&RequestContext::new(), Arc::clone(&handle));
//!
//! let tx = resolve_transaction::<MemorySource>(&ctx, &DatabaseOptions::read_write()).unwrap();
//! tx.execute("INSERT INTO users VALUES (1)").unwrap();
//!
//! handle.commit(&ctx).unwrap();
//! ```

mod error;
mod handle;
mod isolation;
mod options;
mod resolve;

pub use error::{TransactionError, TransactionResult};
pub use handle::{PostCommitHook, SourceKind, TransactionHandle};
pub use isolation::IsolationLevel;
pub use options::{DatabaseOptions, TxOptions};
pub use resolve::{begin_from_context, resolve_transaction};
