//! Simplified interface for interacting with a message broker.
//!
//! Different brokers provide many different configuration options and
//! features; we do not attempt to provide a unified interface for all of
//! them. Rather, we provide the bare minimum that is sufficient for typed job
//! dispatch: connection management, exchange and queue declaration, binding,
//! publishing, and acknowledged consumption.
//!
//! Two implementations are provided:
//! - [`amqp`]: a real broker, via [`lapin`].
//! - [`in_memory`]: a broker emulation for tests and local development.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    acker::Acker,
    error::Result,
    topology::{ExchangeIdentity, QueueIdentity},
};

/// The delivery mode of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A persistent message is written to disk and survives a broker restart
    /// if its queue is durable.
    #[default]
    Persistent,
    /// An ephemeral message is lost if the broker restarts.
    Ephemeral,
}

/// Per-message publish properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishProperties {
    pub delivery_mode: DeliveryMode,
    pub content_type: &'static str,
}

/// A message handed to a consumer, along with the means to settle it.
#[derive(Debug)]
pub struct Delivery<A> {
    /// The raw payload.
    pub data: Vec<u8>,
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Whether the broker has handed this message out before.
    pub redelivered: bool,
    /// 1 for the first delivery. See [`attempt_number`].
    pub attempt: u32,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub acker: A,
}

/// Derives the attempt number of a delivery.
///
/// Brokers that count deliveries (RabbitMQ quorum queues) report the number
/// of previous attempts in the `x-delivery-count` header. Otherwise the only
/// signal is the redelivered flag, which cannot distinguish a second attempt
/// from a tenth; work queues are declared as quorum queues for that reason.
pub fn attempt_number(delivery_count: Option<u32>, redelivered: bool) -> u32 {
    match delivery_count {
        Some(count) => count.saturating_add(1),
        None if redelivered => 2,
        None => 1,
    }
}

/// A stream of deliveries. An `Err` item means the channel is gone and no
/// further deliveries will follow.
pub type DeliveryStream<A> = BoxStream<'static, Result<Delivery<A>>>;

/// A connection to a broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    /// Open a channel that holds at most `prefetch` unacknowledged deliveries.
    async fn open_channel(&self, prefetch: u16) -> Result<Self::Channel>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

/// A session over which topology, publishing and consumption happen.
///
/// Channels should be cheap to clone such that handler tasks can hold on to
/// one.
#[async_trait]
pub trait Channel: Clone + Send + Sync + 'static {
    type Acker: Acker;

    /// Declare an exchange. Idempotent for identical parameters.
    async fn declare_exchange(&self, exchange: &ExchangeIdentity) -> Result<()>;

    /// Declare a queue. Idempotent for identical parameters.
    async fn declare_queue(&self, queue: &QueueIdentity) -> Result<()>;

    /// Bind a queue to an exchange. Idempotent.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a payload. An empty `exchange` names the default exchange,
    /// which routes by queue name.
    ///
    /// Resolves once the broker has taken responsibility for the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<Self::Acker>>;

    /// Stop the broker from pushing further deliveries to a consumer.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Close the channel. Unsettled deliveries are returned to their queues.
    async fn close(&self) -> Result<()>;
}

pub mod amqp;
pub mod in_memory;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attempt_from_delivery_count() {
        assert_eq!(attempt_number(None, false), 1);
        assert_eq!(attempt_number(None, true), 2);
        assert_eq!(attempt_number(Some(0), false), 1);
        assert_eq!(attempt_number(Some(4), true), 5);
    }
}
