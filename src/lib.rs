#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # strand
//!
//! strand is a small, self-contained HTTP server framework built on a
//! **single-threaded** cooperative runtime.
//!
//! Every accepted connection runs in its own *fiber*, a `!Send` task on a
//! current-thread executor, so service code reads like ordinary blocking
//! code while the whole server multiplexes on one reactor. On top of the
//! fiber/stream core sits a composable request pipeline with virtual-host
//! and regex dispatch, static file serving, FastCGI upstreams, reverse
//! proxying and CONNECT tunnels.
//!
//! ## Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use strand::service::{PlainData, ServiceChain};
//! use strand::TcpServer;
//!
//! fn main() -> strand::Result<()> {
//!     strand::fiber::run(async {
//!         let root = ServiceChain::build(|chain| {
//!             chain.append(PlainData::new(&b"Hello"[..], "text/plain"));
//!         });
//!         let server = TcpServer::bind("127.0.0.1", 8080)?;
//!         server.serve_http(root).await
//!     })
//! }
//! ```
//!
//! ## Concurrency model
//!
//! There is exactly one OS thread and one reactor. Fibers only yield inside
//! stream operations (`read`, `write`, `shutdown`, `pipe`, `connect`), so
//! everything between two of those calls runs atomically with respect to
//! other fibers. See [`fiber`] for the runtime surface.

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};
pub use crate::server::{serve_connection, TcpServer};
pub use crate::stream::Stream;
pub use crate::trx::Transaction;

mod error;
pub mod fiber;
mod proto;
mod server;
pub mod service;
mod stream;
#[cfg(test)]
mod support;
mod trx;

pub use crate::proto::fcgi;
