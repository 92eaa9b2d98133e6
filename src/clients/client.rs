//! Minimal Redis client implementation.
//!
//! Provides an async connect and methods for issuing the supported commands.
//! Every command goes through one generic path: encode the request, write it
//! and claim a read turn, await the turn, decode one reply, shape it. The
//! per-command methods are thin wrappers over [`Client::execute`].
//!
//! A `Client` is a cheap handle over a shared connection: clone it freely
//! and issue commands from many tasks at once. Replies always come back in
//! the order requests were issued, enforced by the connection's FIFO turn
//! queue.

use crate::clients::Pipeline;
use crate::cmd::CommandLine;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::reply::{self, Shape, Value};
use crate::{Error, Result};

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio_stream::Stream;
use tracing::{debug, instrument};

/// Established connection with a Redis server.
///
/// Backed by a single `TcpStream`, `Client` provides basic network client
/// functionality (no pooling, retrying, ...). Connections are established
/// using [`Client::connect`].
///
/// Requests are issued using the various methods of `Client`. One command is
/// attempted exactly once: failures are reported, never retried.
#[derive(Clone, Debug)]
pub struct Client {
    connection: Arc<Connection>,
}

/// A client that has entered pub/sub mode.
///
/// Once clients subscribe to a channel, they may only perform pub/sub
/// related commands. The `Client` type is transitioned to a `Subscriber`
/// type in order to prevent non-pub/sub methods from being called.
pub struct Subscriber {
    connection: Arc<Connection>,
    subscribed_channels: Vec<String>,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub content: Bytes,
}

impl Client {
    /// Establish a connection with the Redis server located at `addr`.
    ///
    /// `addr` may be any type that can be asynchronously converted to a
    /// `SocketAddr`, including the common `"host:port"` string form.
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> Result<Client> {
        let connection = Connection::connect(addr, None).await?;

        Ok(Client {
            connection: Arc::new(connection),
        })
    }

    /// Like [`Client::connect`], with a timeout applied to the connection
    /// attempt and to every socket read. A read that exceeds the timeout
    /// fails the command and poisons the connection; there is no
    /// partial-read recovery.
    pub async fn connect_with_timeout<T: ToSocketAddrs>(
        addr: T,
        timeout: Duration,
    ) -> Result<Client> {
        let connection = Connection::connect(addr, Some(timeout)).await?;

        Ok(Client {
            connection: Arc::new(connection),
        })
    }

    /// Close the connection. Pending and future commands on any clone of
    /// this client resolve with a connection error.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Issue a command and return its shaped reply.
    ///
    /// This is the generic execution path used by every convenience method:
    /// encode, write and claim a turn, await the turn, read one reply,
    /// shape it. A server error reply surfaces as `Err(Error::Server)`;
    /// shaping failures are scoped to this one reply.
    #[instrument(skip(self))]
    pub async fn execute(&self, cmd: CommandLine) -> Result<Value> {
        let shape = Shape::of(cmd.name(), cmd.args());

        let mut request = BytesMut::new();
        cmd.encode(&mut request);
        debug!(command = cmd.name(), "issuing");

        let mut turn = self.connection.send(&request, 1).await?;
        let frame = turn.read_reply().await;
        drop(turn);

        reply::shape(shape, frame?)
    }

    /// Create a non-transactional batch of commands to send as one write.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.connection.clone(), false)
    }

    /// Create a transactional (MULTI/EXEC) batch.
    pub fn transaction(&self) -> Pipeline {
        Pipeline::new(self.connection.clone(), true)
    }

    /// Ping to the server, optionally carrying a message to echo.
    pub async fn ping(&self, msg: Option<Bytes>) -> Result<Bytes> {
        let mut cmd = CommandLine::new("PING");
        if let Some(msg) = msg {
            cmd = cmd.arg(msg);
        }

        match self.execute(cmd).await? {
            Value::Simple(status) => Ok(Bytes::from(status.into_bytes())),
            Value::Bytes(data) => Ok(data),
            other => Err(unexpected("PING", &other)),
        }
    }

    /// Get the value of a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let cmd = CommandLine::new("GET").arg_text(key);

        match self.execute(cmd).await? {
            Value::Bytes(data) => Ok(Some(data)),
            Value::Nil => Ok(None),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// Set `key` to hold the given `value`.
    pub async fn set(&self, key: &str, value: Bytes) -> Result<bool> {
        let cmd = CommandLine::new("SET").arg_text(key).arg(value);
        self.bool_reply("SET", cmd).await
    }

    /// Set `key` to hold the given `value`, expiring after `expiration`.
    pub async fn set_expires(
        &self,
        key: &str,
        value: Bytes,
        expiration: Duration,
    ) -> Result<bool> {
        let cmd = CommandLine::new("SET")
            .arg_text(key)
            .arg(value)
            .arg_text("PX")
            .arg_int(expiration.as_millis() as i64);
        self.bool_reply("SET", cmd).await
    }

    /// Remove a key. Returns whether the key existed.
    pub async fn del(&self, key: &str) -> Result<bool> {
        let cmd = CommandLine::new("DEL").arg_text(key);
        self.bool_reply("DEL", cmd).await
    }

    /// Returns whether a key exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let cmd = CommandLine::new("EXISTS").arg_text(key);
        self.bool_reply("EXISTS", cmd).await
    }

    /// Set a key's time to live. Returns whether the timeout was set.
    pub async fn expire(&self, key: &str, expiration: Duration) -> Result<bool> {
        let cmd = CommandLine::new("EXPIRE")
            .arg_text(key)
            .arg_int(expiration.as_secs() as i64);
        self.bool_reply("EXPIRE", cmd).await
    }

    /// Increment the integer stored at `key`, returning the new value.
    pub async fn incr(&self, key: &str) -> Result<i64> {
        let cmd = CommandLine::new("INCR").arg_text(key);
        self.int_reply("INCR", cmd).await
    }

    /// Add a member to a set. Returns whether the member was newly added.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let cmd = CommandLine::new("SADD").arg_text(key).arg_text(member);
        self.bool_reply("SADD", cmd).await
    }

    /// Remove a member from a set. Returns whether it was present.
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let cmd = CommandLine::new("SREM").arg_text(key).arg_text(member);
        self.bool_reply("SREM", cmd).await
    }

    /// All members of the set stored at `key`.
    pub async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        let cmd = CommandLine::new("SMEMBERS").arg_text(key);

        match self.execute(cmd).await? {
            Value::Set(members) => Ok(members),
            other => Err(unexpected("SMEMBERS", &other)),
        }
    }

    /// Set a hash field. Returns whether the field was newly created.
    pub async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<bool> {
        let cmd = CommandLine::new("HSET")
            .arg_text(key)
            .arg_text(field)
            .arg(value);
        self.bool_reply("HSET", cmd).await
    }

    /// Get a hash field, or `None` if it does not exist.
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        let cmd = CommandLine::new("HGET").arg_text(key).arg_text(field);

        match self.execute(cmd).await? {
            Value::Bytes(data) => Ok(Some(data)),
            Value::Nil => Ok(None),
            other => Err(unexpected("HGET", &other)),
        }
    }

    /// All fields and values of the hash stored at `key`.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let cmd = CommandLine::new("HGETALL").arg_text(key);

        match self.execute(cmd).await? {
            Value::Map(map) => Ok(map),
            other => Err(unexpected("HGETALL", &other)),
        }
    }

    /// Push a value onto the head of a list, returning the new length.
    pub async fn lpush(&self, key: &str, value: Bytes) -> Result<i64> {
        let cmd = CommandLine::new("LPUSH").arg_text(key).arg(value);
        self.int_reply("LPUSH", cmd).await
    }

    /// Push a value onto the tail of a list, returning the new length.
    pub async fn rpush(&self, key: &str, value: Bytes) -> Result<i64> {
        let cmd = CommandLine::new("RPUSH").arg_text(key).arg(value);
        self.int_reply("RPUSH", cmd).await
    }

    /// Pop a value from the tail of a list.
    pub async fn rpop(&self, key: &str) -> Result<Option<Bytes>> {
        let cmd = CommandLine::new("RPOP").arg_text(key);

        match self.execute(cmd).await? {
            Value::Bytes(data) => Ok(Some(data)),
            Value::Nil => Ok(None),
            other => Err(unexpected("RPOP", &other)),
        }
    }

    /// The elements of the list stored at `key` between `start` and `stop`.
    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let cmd = CommandLine::new("LRANGE")
            .arg_text(key)
            .arg_int(start)
            .arg_int(stop);
        self.list_reply("LRANGE", cmd).await
    }

    /// Add a member with the given score to a sorted set, returning the
    /// number of newly added members.
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<i64> {
        let cmd = CommandLine::new("ZADD")
            .arg_text(key)
            .arg_text(&score.to_string())
            .arg_text(member);
        self.int_reply("ZADD", cmd).await
    }

    /// The members of the sorted set at `key` between ranks `start` and
    /// `stop`, in score order.
    pub async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let cmd = CommandLine::new("ZRANGE")
            .arg_text(key)
            .arg_int(start)
            .arg_int(stop);
        self.list_reply("ZRANGE", cmd).await
    }

    /// Like [`Client::zrange`], additionally returning each member's score.
    pub async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>> {
        let cmd = CommandLine::new("ZRANGE")
            .arg_text(key)
            .arg_int(start)
            .arg_int(stop)
            .arg_text("WITHSCORES");

        match self.execute(cmd).await? {
            Value::Scores(pairs) => Ok(pairs),
            other => Err(unexpected("ZRANGE", &other)),
        }
    }

    /// Post a message to the given channel, returning the number of
    /// subscribers it was delivered to.
    pub async fn publish(&self, channel: &str, message: Bytes) -> Result<i64> {
        let cmd = CommandLine::new("PUBLISH").arg_text(channel).arg(message);
        self.int_reply("PUBLISH", cmd).await
    }

    /// Subscribe the client to the specified channels.
    ///
    /// Once a client issues a subscribe command, it may no longer issue any
    /// non-pub/sub commands. The client is consumed and a `Subscriber` is
    /// returned; messages are read with [`Subscriber::next_message`]. Peer
    /// clones of this client should not share the connection with a
    /// subscriber.
    #[instrument(skip(self))]
    pub async fn subscribe(self, channels: Vec<String>) -> Result<Subscriber> {
        let mut cmd = CommandLine::new("SUBSCRIBE");
        for channel in &channels {
            cmd = cmd.arg_text(channel);
        }

        let mut request = BytesMut::new();
        cmd.encode(&mut request);

        // The server confirms each channel individually; all confirmations
        // belong to this one turn.
        let mut turn = self.connection.send(&request, channels.len()).await?;
        for channel in &channels {
            let frame = turn.read_reply().await?;
            expect_subscription_ack("subscribe", channel, frame)?;
        }
        drop(turn);

        Ok(Subscriber {
            connection: self.connection,
            subscribed_channels: channels,
        })
    }

    async fn bool_reply(&self, name: &'static str, cmd: CommandLine) -> Result<bool> {
        match self.execute(cmd).await? {
            Value::Bool(value) => Ok(value),
            other => Err(unexpected(name, &other)),
        }
    }

    async fn int_reply(&self, name: &'static str, cmd: CommandLine) -> Result<i64> {
        match self.execute(cmd).await? {
            Value::Int(value) => Ok(value),
            other => Err(unexpected(name, &other)),
        }
    }

    async fn list_reply(&self, name: &'static str, cmd: CommandLine) -> Result<Vec<Bytes>> {
        let items = match self.execute(cmd).await? {
            Value::List(items) => items,
            Value::Nil => vec![],
            other => return Err(unexpected(name, &other)),
        };

        items
            .into_iter()
            .map(|item| match item {
                Value::Bytes(data) => Ok(data),
                other => Err(unexpected(name, &other)),
            })
            .collect()
    }
}

impl Subscriber {
    /// The channels this subscriber is currently subscribed to.
    pub fn get_subscribed(&self) -> &[String] {
        &self.subscribed_channels
    }

    /// Receive the next message published on a subscribed channel, waiting
    /// if necessary.
    ///
    /// `None` indicates the server closed the stream; the subscription is
    /// over.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        let mut turn = self.connection.turn()?;
        let frame = turn.try_read_reply().await?;
        drop(turn);

        match frame {
            Some(frame) => {
                debug!(?frame, "pubsub");
                parse_message(frame).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Convert the subscriber into a `Stream` yielding new messages.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<Message>> {
        try_stream! {
            while let Some(message) = self.next_message().await? {
                yield message;
            }
        }
    }

    /// Unsubscribe from the given channels, or from all currently
    /// subscribed channels when `channels` is empty.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&mut self, channels: &[String]) -> Result<()> {
        let mut cmd = CommandLine::new("UNSUBSCRIBE");
        for channel in channels {
            cmd = cmd.arg_text(channel);
        }

        let mut request = BytesMut::new();
        cmd.encode(&mut request);

        // An empty unsubscribe drops every subscription; the server still
        // acknowledges each one.
        let expected = if channels.is_empty() {
            self.subscribed_channels.len()
        } else {
            channels.len()
        };

        let mut turn = self.connection.send(&request, expected).await?;
        for _ in 0..expected {
            let frame = turn.read_reply().await?;
            let channel = subscription_ack_channel("unsubscribe", frame)?;
            self.subscribed_channels.retain(|c| *c != channel);
        }

        Ok(())
    }
}

/// A delivered message is a three element array tagged `message`.
fn parse_message(frame: Frame) -> Result<Message> {
    let mut items = match frame {
        Frame::Array(items) => items.into_iter(),
        other => return Err(bad_push(&other)),
    };

    match (items.next(), items.next(), items.next()) {
        (Some(Frame::Bulk(kind)), Some(Frame::Bulk(channel)), Some(Frame::Bulk(content)))
            if kind[..] == b"message"[..] =>
        {
            let channel = String::from_utf8(channel.to_vec())
                .map_err(|_| Error::Protocol("invalid UTF-8 in channel name".to_string()))?;
            Ok(Message { channel, content })
        }
        _ => Err(Error::Protocol(
            "expected a pubsub message frame".to_string(),
        )),
    }
}

fn expect_subscription_ack(kind: &str, channel: &str, frame: Frame) -> Result<()> {
    let acked = subscription_ack_channel(kind, frame)?;
    if acked == channel {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "{} ack for unexpected channel `{}`",
            kind, acked
        )))
    }
}

fn subscription_ack_channel(kind: &str, frame: Frame) -> Result<String> {
    if let Frame::Error(line) = frame {
        return Err(Error::server(line));
    }

    let mut items = match frame {
        Frame::Array(items) => items.into_iter(),
        other => return Err(bad_push(&other)),
    };

    match (items.next(), items.next(), items.next()) {
        (Some(Frame::Bulk(tag)), Some(Frame::Bulk(channel)), Some(Frame::Integer(_)))
            if tag[..] == *kind.as_bytes() =>
        {
            String::from_utf8(channel.to_vec())
                .map_err(|_| Error::Protocol("invalid UTF-8 in channel name".to_string()))
        }
        _ => Err(Error::Protocol(format!("expected a {} ack", kind))),
    }
}

fn bad_push(frame: &Frame) -> Error {
    Error::Protocol(format!("expected a pubsub frame, got {:?}", frame))
}

fn unexpected(command: &str, value: &Value) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", command, value))
}
