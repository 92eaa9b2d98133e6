//! Provides a type representing a Redis protocol frame as well as utilities for
//! parsing frames from a byte array.
//!
//! Replies are length prefixed, so the codec works in two phases: `check`
//! scans a cursor to decide whether a complete top-level frame is buffered,
//! and only then does `parse` allocate and build the value. A caller that
//! gets `Error::Incomplete` suspends on the socket and retries once more
//! bytes arrive; decoding therefore never blocks mid-structure.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// A frame in the Redis protocol.
///
/// `Null` covers both the nil bulk reply (`$-1`) and the nil array reply
/// (`*-1`); the two are indistinguishable to callers and Redis uses them
/// interchangeably to mean "no value".
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data is available to parse a message
    Incomplete,

    /// Invalid message encoding
    Other(String),
}

impl Frame {
    /// Checks if an entire message can be decoded from `src`.
    ///
    /// On success the cursor is left just past the end of the frame, so its
    /// position is the number of bytes the frame occupies.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                let len = get_decimal(src)?;
                if len < 0 {
                    // nil bulk, nothing follows the length line
                    return Ok(());
                }
                // payload plus the trailing \r\n
                skip(src, len as usize + 2)
            }
            b'*' => {
                let len = get_decimal(src)?;
                for _ in 0..len.max(0) {
                    Frame::check(src)?;
                }
                Ok(())
            }
            actual => Err(format!("invalid frame type byte `{}`", actual).into()),
        }
    }

    /// The message has already been validated with `check`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::Simple(string))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::Error(string))
            }
            b':' => {
                let value = get_decimal(src)?;
                Ok(Frame::Integer(value))
            }
            b'$' => {
                let len = get_decimal(src)?;
                if len < 0 {
                    return Ok(Frame::Null);
                }

                let n = len as usize;
                if src.remaining() < n + 2 {
                    return Err(Error::Incomplete);
                }

                let data = Bytes::copy_from_slice(&src.chunk()[..n]);

                if &src.chunk()[n..n + 2] != b"\r\n" {
                    return Err("bulk length prefix inconsistent with payload".into());
                }

                skip(src, n + 2)?;
                Ok(Frame::Bulk(data))
            }
            b'*' => {
                let len = get_decimal(src)?;
                if len < 0 {
                    return Ok(Frame::Null);
                }

                let mut out = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    // An `Error` element does not abort the rest of the
                    // array; EXEC replies carry per-command errors in
                    // position.
                    out.push(Frame::parse(src)?);
                }
                Ok(Frame::Array(out))
            }
            actual => Err(format!("invalid frame type byte `{}`", actual).into()),
        }
    }

    /// Encode this frame into `dst`, bit-exact RESP, recursively for arrays.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(val) => put_line(dst, b'+', val.as_bytes()),
            Frame::Error(val) => put_line(dst, b'-', val.as_bytes()),
            Frame::Integer(val) => put_line(dst, b':', val.to_string().as_bytes()),
            Frame::Null => dst.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(val) => {
                put_line(dst, b'$', val.len().to_string().as_bytes());
                dst.extend_from_slice(val);
                dst.extend_from_slice(b"\r\n");
            }
            Frame::Array(items) => {
                put_line(dst, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(dst);
                }
            }
        }
    }
}

fn put_line(dst: &mut BytesMut, marker: u8, rest: &[u8]) {
    dst.extend_from_slice(&[marker]);
    dst.extend_from_slice(rest);
    dst.extend_from_slice(b"\r\n");
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }

    Ok(src.get_u8())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    src.advance(n);
    Ok(())
}

/// Read a line as a signed decimal. Redis integers are signed; negative
/// lengths (`$-1`, `*-1`) mark nil replies.
fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    use atoi::atoi;

    let line = get_line(src)?;
    atoi::<i64>(line).ok_or_else(|| "invalid decimal line".into())
}

/// Find a line terminated by \r\n, advancing past the terminator.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    if end > 0 {
        for i in start..end - 1 {
            if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
                src.set_position((i + 2) as u64);
                return Ok(&src.get_ref()[start..i]);
            }
        }
    }

    Err(Error::Incomplete)
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src)
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "invalid frame format".into()
    }
}

impl From<TryFromIntError> for Error {
    fn from(_src: TryFromIntError) -> Error {
        "invalid frame format".into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(f),
            Error::Other(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for Error {}
