//! Send requests and receive `Frame` replies over a shared TCP stream.
//!
//! The `Connection` is the one shared mutable resource in this crate. Any
//! number of in-flight commands (from clones of one `Client`, or from a
//! `Pipeline`) use it concurrently, so it enforces the two ordering
//! guarantees everything else relies on:
//!
//! * requests hit the wire in the order `send` is called — the write half is
//!   behind a fair async mutex, and each request's read turn is enqueued
//!   while the writer lock is still held, so wire order and turn order
//!   cannot diverge;
//! * replies are consumed in that same order — reads are gated by a strict
//!   FIFO queue of `Turn`s, with at most one turn outstanding at a time.
//!
//! A connection-level failure (I/O error, timeout, unexpected close,
//! unparseable bytes) is terminal: the queue is poisoned and the active
//! turn, every queued turn, and every later operation all resolve with the
//! same error rather than hang.
//!
//! Cancelling a command future (dropping it mid-`select!`, wrapping it in a
//! timeout) is also terminal once its request reached the wire: the reply
//! the server will send has no consumer, and letting the next caller read
//! it would hand everyone downstream the wrong reply. A `Turn` dropped
//! while it still owes reads poisons the connection instead.

use crate::frame::{self, Frame};
use crate::{Error, Result};

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::io::Cursor;
use std::sync::Mutex as StateMutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time;
use tracing::debug;

#[derive(Debug)]
pub struct Connection {
    /// Write half, decorated with a write-level buffer so that one request
    /// (or one whole pipeline batch) reaches the socket as a single unit.
    writer: Mutex<BufWriter<OwnedWriteHalf>>,

    /// Read half plus the buffer frames are parsed out of. Only the holder
    /// of the active turn touches this.
    reader: Mutex<Reader>,

    /// FIFO turn state. A sync mutex is enough: it is only ever held for a
    /// few pointer operations, never across an await point.
    turns: StateMutex<TurnQueue>,

    /// Signalled when the connection is poisoned, so a read blocked on the
    /// socket observes the failure instead of waiting for the server.
    died: Notify,

    /// Optional per-read timeout. Applies to each socket refill while a
    /// reply is being decoded.
    timeout: Option<Duration>,
}

#[derive(Debug)]
struct Reader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

#[derive(Debug)]
struct TurnQueue {
    /// Whether some turn is currently granted.
    active: bool,

    /// Waiters in request order. The front waiter is granted when the
    /// active turn is released.
    waiters: VecDeque<oneshot::Sender<Result<()>>>,

    /// Set once the connection has failed or been closed; every later
    /// operation resolves with a clone of this error.
    dead: Option<Error>,
}

impl Connection {
    /// Establish a connection to the given address.
    pub async fn connect<T: ToSocketAddrs>(
        addr: T,
        timeout: Option<Duration>,
    ) -> Result<Connection> {
        let socket = match timeout {
            Some(dur) => time::timeout(dur, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Connection("connect timed out".to_string()))??,
            None => TcpStream::connect(addr).await?,
        };

        let (read_half, write_half) = socket.into_split();

        Ok(Connection {
            writer: Mutex::new(BufWriter::new(write_half)),
            reader: Mutex::new(Reader {
                stream: read_half,
                buffer: BytesMut::with_capacity(4 * 1024),
            }),
            turns: StateMutex::new(TurnQueue {
                active: false,
                waiters: VecDeque::new(),
                dead: None,
            }),
            died: Notify::new(),
            timeout,
        })
    }

    /// Write one contiguous request unit and claim the turn for its
    /// `replies` replies.
    ///
    /// The returned `Turn` is this request's place in the reply order. The
    /// turn is enqueued before the writer lock is released, which is what
    /// makes turn order match wire order under concurrent callers.
    pub(crate) async fn send(&self, buf: &[u8], replies: usize) -> Result<Turn<'_>> {
        let mut writer = self.writer.lock().await;

        if let Some(err) = self.dead_error() {
            return Err(err);
        }

        // If this future is dropped at the await below, an unknown prefix
        // of the request may already be on the wire; the guard poisons the
        // connection unless the write ran to completion.
        let mut guard = SendGuard {
            connection: self,
            armed: true,
        };
        let wrote = self.write_inner(&mut writer, buf).await;
        guard.armed = false;

        if let Err(err) = wrote {
            return Err(self.fail(err.into()));
        }

        self.claim(replies)
    }

    async fn write_inner(
        &self,
        writer: &mut BufWriter<OwnedWriteHalf>,
        buf: &[u8],
    ) -> std::io::Result<()> {
        writer.write_all(buf).await?;
        writer.flush().await
    }

    /// Claim the next read turn without writing anything. Used by the
    /// subscriber, whose messages arrive without a matching request; the
    /// turn owes no reads, so dropping it before a message arrives is
    /// harmless.
    pub(crate) fn turn(&self) -> Result<Turn<'_>> {
        self.claim(0)
    }

    fn claim(&self, owed: usize) -> Result<Turn<'_>> {
        let mut turns = self.turns.lock().unwrap();

        if let Some(err) = &turns.dead {
            return Err(err.clone());
        }

        let pending = if turns.active {
            let (tx, rx) = oneshot::channel();
            turns.waiters.push_back(tx);
            Some(rx)
        } else {
            turns.active = true;
            None
        };

        Ok(Turn {
            connection: self,
            pending,
            owed,
        })
    }

    /// Close the connection. Pending and future operations, including a
    /// read already blocked on the socket, resolve with a connection error.
    pub async fn disconnect(&self) {
        let _ = self.fail(Error::Connection("connection closed".to_string()));
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn dead_error(&self) -> Option<Error> {
        self.turns.lock().unwrap().dead.clone()
    }

    /// Poison the connection. The first error wins and is what every
    /// queued waiter, and every later caller, observes.
    fn fail(&self, err: Error) -> Error {
        let mut turns = self.turns.lock().unwrap();

        if turns.dead.is_none() {
            turns.dead = Some(err);
        }
        let err = turns.dead.clone().unwrap();

        for waiter in turns.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        turns.active = false;

        self.died.notify_waiters();

        err
    }

    /// Grant the turn to the next queued waiter, if any.
    fn release_turn(&self) {
        let mut turns = self.turns.lock().unwrap();

        loop {
            match turns.waiters.pop_front() {
                Some(waiter) => {
                    // A waiter whose receiver was dropped never held the
                    // turn; grant the next one in line.
                    if waiter.send(Ok(())).is_ok() {
                        return;
                    }
                }
                None => {
                    turns.active = false;
                    return;
                }
            }
        }
    }

    /// Read one top-level reply. `Ok(None)` means the server closed the
    /// stream cleanly before sending any byte of a reply; the connection is
    /// poisoned either way, since nothing further can be read from it.
    async fn read_frame(&self, reader: &mut Reader) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.parse_frame(&mut reader.buffer)? {
                debug!(?frame, "received");
                return Ok(Some(frame));
            }

            let Reader { stream, buffer } = reader;

            // Register for the poison notification before re-checking the
            // flag, so a `fail` racing with this refill cannot be missed.
            let died = self.died.notified();
            if let Some(err) = self.dead_error() {
                return Err(err);
            }

            let refill = async {
                match self.timeout {
                    Some(dur) => time::timeout(dur, stream.read_buf(buffer))
                        .await
                        .unwrap_or_else(|_| {
                            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
                        }),
                    None => stream.read_buf(buffer).await,
                }
            };

            let read = tokio::select! {
                read = refill => read,
                _ = died => {
                    return Err(self.dead_error().unwrap_or_else(|| {
                        Error::Connection("connection closed".to_string())
                    }));
                }
            };

            match read {
                Ok(0) => {
                    // A clean close can only happen on a reply boundary. If
                    // the buffer still holds a partial frame, the peer reset
                    // mid-reply.
                    if reader.buffer.is_empty() {
                        let _ = self.fail(Error::Connection(
                            "connection closed by server".to_string(),
                        ));
                        return Ok(None);
                    }
                    return Err(
                        self.fail(Error::Connection("connection reset by peer".to_string()))
                    );
                }
                Ok(_) => {}
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    /// Try to parse a frame out of the read buffer. `Ok(None)` means more
    /// data is needed; malformed bytes poison the connection, because the
    /// stream position is no longer trustworthy.
    fn parse_frame(&self, buffer: &mut BytesMut) -> Result<Option<Frame>> {
        use frame::Error::Incomplete;

        let mut cursor = Cursor::new(&buffer[..]);

        match Frame::check(&mut cursor) {
            Ok(()) => {
                let len = cursor.position() as usize;
                cursor.set_position(0);

                let frame = Frame::parse(&mut cursor).map_err(|err| self.fail(err.into()))?;
                buffer.advance(len);

                Ok(Some(frame))
            }
            Err(Incomplete) => Ok(None),
            Err(err) => Err(self.fail(err.into())),
        }
    }
}

/// The right to perform the next read on a `Connection`.
///
/// Granted strictly in FIFO order; dropped (or explicitly finished) turns
/// pass the grant to the next in line.
#[derive(Debug)]
pub(crate) struct Turn<'a> {
    connection: &'a Connection,
    /// `Some` while still queued behind earlier turns; `None` once granted.
    pending: Option<oneshot::Receiver<Result<()>>>,
    /// Replies the holder has yet to read. A turn dropped while it still
    /// owes reads leaves the stream misaligned for everyone behind it, so
    /// the connection is poisoned.
    owed: usize,
}

impl Turn<'_> {
    async fn granted(&mut self) -> Result<()> {
        if let Some(rx) = self.pending.take() {
            match rx.await {
                Ok(result) => result?,
                // The queue itself went away, which only happens when the
                // connection is dropped wholesale.
                Err(_) => return Err(Error::Connection("connection closed".to_string())),
            }
        }
        Ok(())
    }

    /// Read one reply, suspending first until this turn is granted.
    pub(crate) async fn read_reply(&mut self) -> Result<Frame> {
        self.try_read_reply().await?.ok_or_else(|| {
            Error::Connection("connection closed by server".to_string())
        })
    }

    /// Like `read_reply`, but a clean close on a reply boundary yields
    /// `Ok(None)` instead of an error. Subscribers use this to turn the end
    /// of the stream into the end of the message sequence.
    pub(crate) async fn try_read_reply(&mut self) -> Result<Option<Frame>> {
        self.granted().await?;
        let mut reader = self.connection.reader.lock().await;
        let frame = self.connection.read_frame(&mut reader).await?;
        if frame.is_some() {
            self.owed = self.owed.saturating_sub(1);
        }
        Ok(frame)
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        // A reply with no consumer would be handed to the next caller in
        // line, shifting every reply after it by one.
        if self.owed > 0 {
            let _ = self.connection.fail(Error::Connection(
                "reply abandoned before it was read".to_string(),
            ));
            return;
        }

        // Only a granted turn passes the grant on. A turn dropped while
        // still queued just leaves a dead waiter for `release_turn` to skip.
        if self.pending.is_none() {
            self.connection.release_turn();
        }
    }
}

struct SendGuard<'a> {
    connection: &'a Connection,
    armed: bool,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.connection.fail(Error::Connection(
                "request abandoned mid-write".to_string(),
            ));
        }
    }
}
