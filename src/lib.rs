//! TokMesh: a distributed session-and-token service.
//!
//! The crate is organized leaves-first:
//!
//! - [`domain`] — sessions, API keys, and token formats
//! - [`storage`] — repository traits plus the in-memory engine
//! - [`session`], [`token`], [`auth`] — the domain services
//! - [`cluster`] — shard map, replicated state machine, discovery,
//!   rebalancing, and the cluster RPC plane
//! - [`runtime`] — worker supervision and shutdown
//!
//! Wire protocols (RESP/HTTP/admin) and persistent storage engines are
//! deliberately out of scope; they integrate through the traits in
//! [`storage`] and the service APIs re-exported here.

pub mod auth;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod token;
pub mod utils;

pub use error::{Error, Result};
