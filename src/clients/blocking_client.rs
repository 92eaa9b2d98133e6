//! Minimal blocking wrapper around the async client.
//!
//! Useful from synchronous code that does not run its own Tokio runtime.
//! The wrapper owns a `current_thread` runtime and drives the async client
//! to completion on each call.

use crate::clients::{Client, Message, Pipeline};
use crate::cmd::CommandLine;
use crate::reply::Value;
use crate::Result;

use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio::runtime::Runtime;

/// Established connection with a Redis server, driven from blocking code.
pub struct BlockingClient {
    inner: Client,
    rt: Runtime,
}

/// A blocking client that has entered pub/sub mode.
pub struct BlockingSubscriber {
    inner: crate::clients::Subscriber,
    rt: Runtime,
}

impl BlockingClient {
    /// Establish a connection with the Redis server located at `addr`.
    pub fn connect<T: ToSocketAddrs>(addr: T) -> Result<BlockingClient> {
        let rt = runtime()?;
        let inner = rt.block_on(Client::connect(addr))?;

        Ok(BlockingClient { inner, rt })
    }

    /// Like `connect`, with a connect and per-read timeout.
    pub fn connect_with_timeout<T: ToSocketAddrs>(
        addr: T,
        timeout: Duration,
    ) -> Result<BlockingClient> {
        let rt = runtime()?;
        let inner = rt.block_on(Client::connect_with_timeout(addr, timeout))?;

        Ok(BlockingClient { inner, rt })
    }

    pub fn disconnect(&mut self) {
        self.rt.block_on(self.inner.disconnect());
    }

    /// Issue a command and block until its shaped reply arrives.
    pub fn execute(&mut self, cmd: CommandLine) -> Result<Value> {
        self.rt.block_on(self.inner.execute(cmd))
    }

    /// Send a batch of queued commands as one write and block for all of
    /// their results.
    pub fn execute_pipeline(&mut self, pipeline: &mut Pipeline) -> Result<Vec<Result<Value>>> {
        self.rt.block_on(pipeline.execute())
    }

    /// Create a batch handle tied to this client's connection.
    pub fn pipeline(&self) -> Pipeline {
        self.inner.pipeline()
    }

    pub fn transaction(&self) -> Pipeline {
        self.inner.transaction()
    }

    pub fn ping(&mut self, msg: Option<Bytes>) -> Result<Bytes> {
        self.rt.block_on(self.inner.ping(msg))
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        self.rt.block_on(self.inner.get(key))
    }

    pub fn set(&mut self, key: &str, value: Bytes) -> Result<bool> {
        self.rt.block_on(self.inner.set(key, value))
    }

    pub fn del(&mut self, key: &str) -> Result<bool> {
        self.rt.block_on(self.inner.del(key))
    }

    pub fn smembers(&mut self, key: &str) -> Result<HashSet<String>> {
        self.rt.block_on(self.inner.smembers(key))
    }

    pub fn publish(&mut self, channel: &str, message: Bytes) -> Result<i64> {
        self.rt.block_on(self.inner.publish(channel, message))
    }

    /// Subscribe to the given channels, consuming the client.
    pub fn subscribe(self, channels: Vec<String>) -> Result<BlockingSubscriber> {
        let subscriber = self.rt.block_on(self.inner.subscribe(channels))?;

        Ok(BlockingSubscriber {
            inner: subscriber,
            rt: self.rt,
        })
    }
}

impl BlockingSubscriber {
    pub fn get_subscribed(&self) -> &[String] {
        self.inner.get_subscribed()
    }

    /// Block until the next message on a subscribed channel, or `None` when
    /// the server closes the stream.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        self.rt.block_on(self.inner.next_message())
    }

    pub fn unsubscribe(&mut self, channels: &[String]) -> Result<()> {
        self.rt.block_on(self.inner.unsubscribe(channels))
    }
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(crate::Error::from)
}
