//! # Tollgate Core
//!
//! Core types shared by every Tollgate crate.
//!
//! - [`ExecutionContext`] - Per-exchange state handed to every policy
//! - [`RequestId`] - UUID v7 request identifier
//! - [`PolicyResult`] - Structured interruption payload a policy emits
//! - [`PolicyError`] - Error type returned by policy hooks
//! - [`BoxFuture`] - Boxed future used by asynchronous hooks

#![doc(html_root_url = "https://docs.rs/tollgate-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod context;
mod error;

pub use context::{ExecutionContext, RequestId};
pub use error::{PolicyError, PolicyResult};

use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
