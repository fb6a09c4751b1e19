//! txscope - one database transaction per request
//!
//! This crate scopes database transactions to inbound unary requests. An
//! interceptor creates a transaction handle for every call, business logic
//! asks the request context for the transaction as often as it likes, and the
//! interceptor commits on success or rolls back on error or panic.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use txscope::context::RequestContext;
//! use txscope::interceptor::{Status, TransactionInterceptor, UnaryInterceptor, UnaryServerInfo};
//! use txscope::source::MemorySource;
//! use txscope::transaction::{resolve_transaction, DatabaseOptions};
//!
//! let primary = Arc::new(MemorySource::new("primary"));
//! let replica = Arc::new(MemorySource::new("replica"));
//! let interceptor = TransactionInterceptor::with_replica(primary, Some(Arc::clone(&replica)));
//!
//! let info = UnaryServerInfo::new("/users.v1.Users/List");
//! let resp = interceptor.intercept(&RequestContext::new(), (), &info, |ctx, ()| {
//!     let tx = resolve_transaction::<MemorySource>(&ctx, &DatabaseOptions::read_only_replica())?;
//!     Ok::<_, Status>(tx.source_name().to_string())
//! });
//!
//! assert_eq!(resp.unwrap(), "replica");
//! assert_eq!(replica.commits(), 1);
//! ```

pub mod context;
pub mod interceptor;
pub mod source;
pub mod transaction;
