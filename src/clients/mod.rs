//! Clients for issuing commands over a shared connection.

mod blocking_client;
pub use blocking_client::{BlockingClient, BlockingSubscriber};

mod client;
pub use client::{Client, Message, Subscriber};

mod pipeline;
pub use pipeline::Pipeline;
