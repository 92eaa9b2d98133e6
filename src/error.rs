//! Error taxonomy shared across the crate.
//!
//! Every failure a caller can observe falls into one of three buckets:
//! the transport failed (`Connection`), the bytes on the wire did not match
//! the reply grammar (`Protocol`), or the server answered with a well-formed
//! `-ERR ...` line (`Server`).

use crate::frame;

use std::io;
use thiserror::Error as ThisError;

/// Error returned by every fallible operation in this crate.
///
/// `Connection` and `Protocol` errors are terminal for the connection that
/// produced them: the stream is no longer in a known state, so the connection
/// is poisoned and every pending or future operation on it resolves with the
/// same error. A `Server` error is scoped to a single reply and leaves the
/// connection usable.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// The transport failed to establish, timed out, or closed unexpectedly.
    #[error("connection error; {0}")]
    Connection(String),

    /// Received bytes did not match any recognized reply grammar, or a
    /// length prefix was inconsistent with the data that followed.
    #[error("protocol error; {0}")]
    Protocol(String),

    /// The server replied with an error line, e.g. `-WRONGTYPE ...`.
    #[error("{kind} {message}")]
    Server { kind: String, message: String },
}

impl Error {
    /// Build a `Server` error from the text of a `-` reply line.
    ///
    /// Redis prefixes error replies with an all-caps code (`ERR`,
    /// `WRONGTYPE`, `EXECABORT`, ...). The code is split off into `kind`;
    /// lines without a recognizable code default to `ERR`.
    pub(crate) fn server(line: String) -> Error {
        match line.split_once(' ') {
            Some((kind, rest)) if is_error_code(kind) => Error::Server {
                kind: kind.to_string(),
                message: rest.to_string(),
            },
            _ => Error::Server {
                kind: "ERR".to_string(),
                message: line,
            },
        }
    }

    /// Returns `true` for transport-level failures.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// The error code of a `Server` error, e.g. `"WRONGTYPE"`.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Error::Server { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

fn is_error_code(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_uppercase())
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::Connection(src.to_string())
    }
}

impl From<frame::Error> for Error {
    fn from(src: frame::Error) -> Error {
        match src {
            frame::Error::Incomplete => Error::Protocol("unexpected end of frame".to_string()),
            frame::Error::Other(msg) => Error::Protocol(msg),
        }
    }
}
