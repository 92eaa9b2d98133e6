//! An asynchronous, pipelined Redis client.
//!
//! Designed for applications that issue many logically concurrent commands
//! over a single TCP connection. Requests hit the wire in call order and
//! replies are consumed in exactly that order, enforced by a FIFO "turn"
//! queue on the connection; individual commands never block each other's
//! writes, and batches ([`Pipeline`]) go out as one contiguous write.
//!
//! Concurrency here is cooperative: commands are suspended futures
//! interleaved on the runtime, never parallel writers to the socket. To
//! wait on several commands at once, poll their futures together (e.g.
//! `futures::future::join_all`); completion order matches issue order.

pub mod clients;
pub use clients::{BlockingClient, Client, Pipeline};

pub mod cmd;
pub use cmd::CommandLine;

pub mod frame;
pub use frame::Frame;

pub mod connection;
pub use connection::Connection;

pub mod reply;
pub use reply::Value;

mod error;
pub use error::Error;

/// Default port that a redis server listens on.
///
/// Used if no port is specified.
pub const DEFAULT_PORT: u16 = 6379;

/// A specialized `Result` type for this crate's operations.
///
/// Defined as a convenience.
pub type Result<T> = std::result::Result<T, Error>;
