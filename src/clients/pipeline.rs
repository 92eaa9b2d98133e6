//! Batches of commands sent as a single write.
//!
//! A `Pipeline` queues command lines privately; nothing touches the wire
//! until [`Pipeline::execute`]. The whole batch is then written as one
//! contiguous unit under the writer lock, so another caller's commands can
//! never interleave mid-batch, and its replies are consumed under a single
//! read turn.
//!
//! A transactional batch is the same wire sequence wrapped in MULTI/EXEC.
//! The MULTI ack and per-command QUEUED acks are validated and discarded;
//! the caller only ever sees the real results from the final EXEC array.

use crate::cmd::CommandLine;
use crate::connection::{Connection, Turn};
use crate::frame::Frame;
use crate::reply::{self, Shape, Value};
use crate::{Error, Result};

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, instrument};

/// An ordered batch of commands plus the transactional flag.
///
/// Created with [`Client::pipeline`](crate::clients::Client::pipeline) or
/// [`Client::transaction`](crate::clients::Client::transaction).
#[derive(Debug)]
pub struct Pipeline {
    connection: Arc<Connection>,
    queued: Vec<CommandLine>,
    transactional: bool,
}

impl Pipeline {
    pub(crate) fn new(connection: Arc<Connection>, transactional: bool) -> Pipeline {
        Pipeline {
            connection,
            queued: vec![],
            transactional,
        }
    }

    /// Queue an arbitrary command line.
    pub fn cmd(&mut self, cmd: CommandLine) -> &mut Pipeline {
        self.queued.push(cmd);
        self
    }

    /// Number of commands currently queued.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Abandon the batch. Nothing is ever written for discarded commands.
    pub fn discard(&mut self) {
        self.queued.clear();
    }

    pub fn get(&mut self, key: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("GET").arg_text(key))
    }

    pub fn set(&mut self, key: &str, value: Bytes) -> &mut Pipeline {
        self.cmd(CommandLine::new("SET").arg_text(key).arg(value))
    }

    pub fn del(&mut self, key: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("DEL").arg_text(key))
    }

    pub fn exists(&mut self, key: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("EXISTS").arg_text(key))
    }

    pub fn incr(&mut self, key: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("INCR").arg_text(key))
    }

    pub fn sadd(&mut self, key: &str, member: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("SADD").arg_text(key).arg_text(member))
    }

    pub fn smembers(&mut self, key: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("SMEMBERS").arg_text(key))
    }

    pub fn hset(&mut self, key: &str, field: &str, value: Bytes) -> &mut Pipeline {
        self.cmd(
            CommandLine::new("HSET")
                .arg_text(key)
                .arg_text(field)
                .arg(value),
        )
    }

    pub fn hgetall(&mut self, key: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("HGETALL").arg_text(key))
    }

    pub fn rpush(&mut self, key: &str, value: Bytes) -> &mut Pipeline {
        self.cmd(CommandLine::new("RPUSH").arg_text(key).arg(value))
    }

    pub fn rpop(&mut self, key: &str) -> &mut Pipeline {
        self.cmd(CommandLine::new("RPOP").arg_text(key))
    }

    /// Send the batch and collect one result per queued command, in queue
    /// order.
    ///
    /// A server error on command *i* occupies position *i* and never blocks
    /// decoding of the commands after it. A connection-level failure aborts
    /// the whole batch with `Err`. An empty batch resolves immediately
    /// without touching the wire. The queue is consumed either way; the
    /// pipeline can be reused for a fresh batch afterwards.
    #[instrument(skip(self))]
    pub async fn execute(&mut self) -> Result<Vec<Result<Value>>> {
        let queued = std::mem::take(&mut self.queued);
        if queued.is_empty() {
            return Ok(vec![]);
        }

        let shapes: Vec<Shape> = queued
            .iter()
            .map(|cmd| Shape::of(cmd.name(), cmd.args()))
            .collect();

        let mut request = BytesMut::new();
        if self.transactional {
            CommandLine::new("MULTI").encode(&mut request);
        }
        for cmd in &queued {
            cmd.encode(&mut request);
        }
        if self.transactional {
            CommandLine::new("EXEC").encode(&mut request);
        }

        debug!(
            commands = queued.len(),
            transactional = self.transactional,
            "executing batch"
        );

        // One turn covers the whole batch: the batch is contiguous on the
        // wire, so its replies are contiguous too. A transactional batch
        // additionally owes the MULTI ack and the EXEC reply.
        let replies = shapes.len() + if self.transactional { 2 } else { 0 };
        let mut turn = self.connection.send(&request, replies).await?;
        if self.transactional {
            read_transaction(&mut turn, &shapes).await
        } else {
            read_batch(&mut turn, &shapes).await
        }
    }
}

async fn read_batch(turn: &mut Turn<'_>, shapes: &[Shape]) -> Result<Vec<Result<Value>>> {
    let mut results = Vec::with_capacity(shapes.len());
    for shape in shapes {
        let frame = turn.read_reply().await?;
        results.push(reply::shape(*shape, frame));
    }
    Ok(results)
}

/// A transactional batch always consumes exactly N+2 replies: the MULTI
/// ack, N QUEUED acks, and the EXEC array of the N real results.
async fn read_transaction(turn: &mut Turn<'_>, shapes: &[Shape]) -> Result<Vec<Result<Value>>> {
    expect_status(turn.read_reply().await?, "OK")?;

    for _ in shapes {
        queued_ack(turn.read_reply().await?)?;
    }

    match turn.read_reply().await? {
        // The transaction aborted before EXEC (e.g. a watched-key
        // conflict); there are no results.
        Frame::Null => Ok(vec![]),
        Frame::Array(items) => {
            if items.len() != shapes.len() {
                return Err(Error::Protocol(format!(
                    "EXEC returned {} results for {} commands",
                    items.len(),
                    shapes.len()
                )));
            }
            Ok(items
                .into_iter()
                .zip(shapes)
                .map(|(frame, shape)| reply::shape(*shape, frame))
                .collect())
        }
        Frame::Error(line) => Err(Error::server(line)),
        other => Err(Error::Protocol(format!(
            "expected EXEC reply, got {:?}",
            other
        ))),
    }
}

fn expect_status(frame: Frame, expected: &str) -> Result<()> {
    match frame {
        Frame::Simple(status) if status == expected => Ok(()),
        Frame::Error(line) => Err(Error::server(line)),
        other => Err(Error::Protocol(format!(
            "expected +{}, got {:?}",
            expected, other
        ))),
    }
}

fn queued_ack(frame: Frame) -> Result<()> {
    match frame {
        Frame::Simple(status) if status == "QUEUED" => Ok(()),
        // A command rejected at queue time answers with an error here; the
        // final EXEC reply reports the abort, so keep consuming acks.
        Frame::Error(_) => Ok(()),
        other => Err(Error::Protocol(format!(
            "expected +QUEUED, got {:?}",
            other
        ))),
    }
}
