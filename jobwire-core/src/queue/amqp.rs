//! AMQP broker binding using [`lapin`].
//!
//! # Example
//!
//! ```no_run
//! use jobwire::{
//!     queue::{Connection, Channel, amqp::AMQPConnection},
//!     topology::QueueIdentity,
//! };
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connection = AMQPConnection::connect("amqp://localhost:5672").await?;
//!     let channel = connection.open_channel(10).await?;
//!     channel.declare_queue(&QueueIdentity::quorum("dfa-queue")).await?;
//!
//!     let mut deliveries = channel.consume("dfa-queue", "my_consumer").await?;
//!     while let Some(delivery) = deliveries.next().await {
//!         let delivery = delivery?;
//!         // ...
//!         jobwire::acker::Acker::ack(&delivery.acker).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, ExchangeKind,
};
use tracing::{debug, instrument};

use super::{
    attempt_number, Connection, Delivery, DeliveryMode, DeliveryStream, PublishProperties,
};
use crate::{
    acker::Acker,
    error::{QueueError, Result},
    topology::{self, ExchangeIdentity, QueueIdentity, QueueType},
};

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const QUEUE_TYPE_ARGUMENT: &str = "x-queue-type";

/// A connection to an AMQP broker.
#[derive(Clone)]
pub struct AMQPConnection {
    connection: Arc<lapin::Connection>,
}

impl AMQPConnection {
    /// Connect to the broker at `uri`.
    ///
    /// There is no retry loop here; a failure is returned as
    /// [`QueueError::Connection`] and reconnection is the caller's decision.
    #[instrument(skip_all, level = "debug")]
    pub async fn connect(uri: &str) -> Result<Self> {
        let options = lapin::ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = lapin::Connection::connect(uri, options)
            .await
            .map_err(|e| QueueError::Connection(e.into()))?;

        Ok(Self {
            connection: Arc::new(connection),
        })
    }
}

#[async_trait]
impl Connection for AMQPConnection {
    type Channel = AMQPChannel;

    /// Open a channel with the given prefetch bound and publisher confirms
    /// enabled.
    async fn open_channel(&self, prefetch: u16) -> Result<Self::Channel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(e.into()))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Channel(e.into()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Channel(e.into()))?;

        debug!(channel_id = channel.id(), prefetch, "channel opened");
        Ok(AMQPChannel { channel })
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "Goodbye")
            .await
            .map_err(|e| QueueError::Connection(e.into()))
    }
}

/// A channel on an [`AMQPConnection`].
#[derive(Clone, Debug)]
pub struct AMQPChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl super::Channel for AMQPChannel {
    type Acker = AMQPAcker;

    #[instrument(skip(self), level = "trace")]
    async fn declare_exchange(&self, exchange: &ExchangeIdentity) -> Result<()> {
        let kind = match exchange.kind {
            topology::ExchangeKind::Fanout => ExchangeKind::Fanout,
            topology::ExchangeKind::Direct => ExchangeKind::Direct,
        };

        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::declaration("exchange", &exchange.name, e))
    }

    #[instrument(skip(self), level = "trace")]
    async fn declare_queue(&self, queue: &QueueIdentity) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                queue_arguments(queue),
            )
            .await
            .map(|_| ())
            .map_err(|e| QueueError::declaration("queue", &queue.name, e))
    }

    #[instrument(skip(self), level = "trace")]
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::binding(queue, exchange, e))
    }

    #[instrument(skip(self, payload), level = "trace")]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        let delivery_mode = match properties.delivery_mode {
            DeliveryMode::Persistent => 2,
            DeliveryMode::Ephemeral => 1,
        };

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(delivery_mode)
                    .with_content_type(ShortString::from(properties.content_type)),
            )
            .await
            .map_err(|e| QueueError::Delivery(e.into()))?
            .await
            .map_err(|e| QueueError::Delivery(e.into()))?;

        if confirmation.is_nack() {
            return Err(QueueError::Delivery(anyhow!(
                "broker refused message for exchange `{exchange}` routing key `{routing_key}`"
            )));
        }

        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<AMQPAcker>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Channel(e.into()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|e| QueueError::Delivery(e.into()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| QueueError::Channel(e.into()))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "Goodbye")
            .await
            .map_err(|e| QueueError::Channel(e.into()))
    }
}

fn queue_arguments(queue: &QueueIdentity) -> FieldTable {
    let mut arguments = FieldTable::default();
    if queue.queue_type == QueueType::Quorum {
        arguments.insert(
            QUEUE_TYPE_ARGUMENT.into(),
            AMQPValue::LongString("quorum".into()),
        );
    }
    if let Some(dead_letter) = &queue.dead_letter {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter.exchange.as_str().into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter.routing_key.as_str().into()),
        );
    }
    arguments
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery<AMQPAcker> {
    let properties = &delivery.properties;
    let count = properties.headers().as_ref().and_then(delivery_count);
    let content_type = properties
        .content_type()
        .as_ref()
        .map(|content_type| content_type.as_str().to_string());
    let persistent = *properties.delivery_mode() == Some(2);

    Delivery {
        attempt: attempt_number(count, delivery.redelivered),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        content_type,
        persistent,
        data: delivery.data,
        acker: AMQPAcker {
            acker: delivery.acker,
        },
    }
}

/// Number of earlier deliveries, as reported by quorum queues.
fn delivery_count(headers: &FieldTable) -> Option<u32> {
    header(headers, DELIVERY_COUNT_HEADER).and_then(as_u32)
}

fn header<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

/// An acker for an AMQP delivery.
#[derive(Debug)]
pub struct AMQPAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AMQPAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Delivery(e.into()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Delivery(e.into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys(arguments: &FieldTable) -> Vec<String> {
        arguments
            .inner()
            .keys()
            .map(|k| k.as_str().to_string())
            .collect()
    }

    #[test]
    fn dead_letter_arguments() {
        let queue = QueueIdentity::durable("dfa-queue").with_dead_letter();
        assert_eq!(
            keys(&queue_arguments(&queue)),
            ["x-dead-letter-exchange", "x-dead-letter-routing-key"]
        );

        assert!(keys(&queue_arguments(&QueueIdentity::durable("dfa-queue"))).is_empty());
    }

    #[test]
    fn quorum_arguments() {
        let queue = QueueIdentity::quorum("dfa-queue");
        let arguments = queue_arguments(&queue);
        assert_eq!(
            header(&arguments, QUEUE_TYPE_ARGUMENT),
            Some(&AMQPValue::LongString("quorum".into()))
        );

        let queue = QueueIdentity::quorum("dfa-queue").with_dead_letter();
        assert_eq!(
            keys(&queue_arguments(&queue)),
            ["x-dead-letter-exchange", "x-dead-letter-routing-key", "x-queue-type"]
        );
    }

    #[test]
    fn delivery_count_header() {
        let mut headers = FieldTable::default();
        assert_eq!(delivery_count(&headers), None);
        assert_eq!(attempt_number(delivery_count(&headers), true), 2);

        headers.insert(DELIVERY_COUNT_HEADER.into(), AMQPValue::LongLongInt(3));
        assert_eq!(delivery_count(&headers), Some(3));
        assert_eq!(attempt_number(delivery_count(&headers), true), 4);

        headers.insert(
            DELIVERY_COUNT_HEADER.into(),
            AMQPValue::LongString("3".into()),
        );
        assert_eq!(delivery_count(&headers), None);

        headers.insert(DELIVERY_COUNT_HEADER.into(), AMQPValue::LongInt(-1));
        assert_eq!(delivery_count(&headers), None);

        let mut unrelated = FieldTable::default();
        unrelated.insert("x-first-death-queue".into(), AMQPValue::LongUInt(3));
        assert_eq!(delivery_count(&unrelated), None);
    }
}
