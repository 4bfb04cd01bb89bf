//! An asynchronous DNS transport engine.
//!
//! This crate provides the transport core of a DNS resolver: it sends
//! opaque, pre-encoded query messages over UDP or TCP, correlates the
//! responses by transaction id, enforces per-query timeouts, and delivers
//! each result through a completion callback, exactly once. It neither
//! encodes nor interprets DNS messages beyond the id in the first two
//! octets.
//!
//! All I/O happens on one dedicated reactor thread owned by the
//! [`Engine`]. Submitting a query through [`Engine::resolve`] never
//! blocks; the callback fires later with the response payload or with the
//! [`Error`] that ended the query.
//!
//! ```no_run
//! use std::time::Duration;
//! use dns_engine::{Config, Engine, Transport};
//!
//! let engine = Engine::new(Config::new()).unwrap();
//! let request = vec![0, 0, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
//! engine.resolve(
//!     request,
//!     "198.51.100.1:53".parse().unwrap(),
//!     Transport::Dgram,
//!     Duration::from_secs(5),
//!     |res| println!("{:?}", res),
//! ).unwrap();
//! ```
#![warn(missing_docs)]
#![warn(clippy::needless_lifetimes)]

mod dgram;
mod engine;
mod error;
mod queries;
mod reactor;
mod stream;
mod timeouts;

pub use self::engine::{Config, Engine, QueryHandle};
pub use self::error::Error;
pub use self::queries::{Executor, Transport};
