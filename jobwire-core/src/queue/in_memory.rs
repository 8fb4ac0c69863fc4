//! An in-memory implementation of [`Connection`] and [`Channel`].
//!
//! This implementation is useful for testing and local development, as it
//! emulates the broker semantics the rest of the crate relies on:
//!
//! - declarations are idempotent, and a conflicting re-declaration fails and
//!   closes the offending channel;
//! - the default exchange routes by queue name, fan-out exchanges copy to
//!   every bound queue, direct exchanges match on routing key;
//! - each channel holds at most `prefetch` unacknowledged deliveries;
//! - a nack with requeue puts the message back at the head of its queue, a
//!   nack without requeue dead-letters it (or drops it);
//! - quorum queues report earlier deliveries of a message, classic queues
//!   only flag it as redelivered;
//! - closing a channel or connection returns its unsettled deliveries to
//!   their queues.
//!
//! An [`InMemoryBroker`] is cheap to clone; every clone shares the same
//! queues, so several connections can emulate several worker processes.
//!
//! ```
//! use jobwire::{
//!     acker::Acker,
//!     queue::{Connection, Channel, DeliveryMode, PublishProperties, in_memory::InMemoryBroker},
//!     topology::QueueIdentity,
//! };
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::new();
//!     let channel = broker.connect().await?.open_channel(10).await?;
//!     channel.declare_queue(&QueueIdentity::durable("dfa-queue")).await?;
//!
//!     let properties = PublishProperties {
//!         delivery_mode: DeliveryMode::Persistent,
//!         content_type: "application/json",
//!     };
//!     channel.publish("", "dfa-queue", b"{}", properties).await?;
//!
//!     let mut deliveries = channel.consume("dfa-queue", "consumer").await?;
//!     let delivery = deliveries.next().await.unwrap()?;
//!     assert_eq!(delivery.data, b"{}");
//!     delivery.acker.ack().await?;
//!
//!     assert_eq!(broker.queue_depth("dfa-queue").await, Some(0));
//!     Ok(())
//! }
//! ```
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};

use super::{
    attempt_number, Channel, Connection, Delivery, DeliveryMode, DeliveryStream,
    PublishProperties,
};
use crate::{
    acker::Acker,
    error::{QueueError, Result},
    topology::{ExchangeIdentity, ExchangeKind, QueueIdentity, QueueType},
};

/// An emulated broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    inner: Mutex<Inner>,
    /// Woken on every state change so parked consumers re-check their queue.
    notify: Notify,
}

#[derive(Default)]
struct Inner {
    unavailable: bool,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    /// Deliveries handed out but not yet settled, by delivery tag.
    unacked: HashMap<u64, Unacked>,
    next_id: u64,
    publishes: u64,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    in_flight: usize,
    consumers: HashSet<String>,
}

struct ExchangeState {
    identity: ExchangeIdentity,
    /// `(queue, routing key)` pairs.
    bindings: Vec<(String, String)>,
}

struct QueueState {
    identity: QueueIdentity,
    ready: VecDeque<Message>,
}

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    content_type: Option<String>,
    persistent: bool,
    delivery_count: u32,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    channel: u64,
    message: Message,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel: u64) -> anyhow::Result<()> {
        if self.unavailable {
            bail!("broker is unavailable");
        }
        if !self.channels.contains_key(&channel) {
            bail!("channel {channel} is closed");
        }
        Ok(())
    }

    /// Closes a channel, returning its unsettled deliveries to their queues
    /// in their original order.
    fn close_channel(&mut self, channel: u64) {
        self.channels.remove(&channel);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> anyhow::Result<()> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let state = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| anyhow!("NOT_FOUND - no exchange '{exchange}'"))?;
            state
                .bindings
                .iter()
                .filter(|(_, key)| {
                    state.identity.kind == ExchangeKind::Fanout || key.as_str() == routing_key
                })
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        // Unroutable messages are dropped, as with a non-mandatory publish.
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(())
    }

    fn requeue(&mut self, unacked: Unacked) {
        let Unacked {
            queue, mut message, ..
        } = unacked;
        message.delivery_count += 1;
        message.redelivered = true;
        if let Some(queue) = self.queues.get_mut(&queue) {
            queue.ready.push_front(message);
        }
    }

    fn dead_letter(&mut self, unacked: Unacked) {
        let target = self
            .queues
            .get(&unacked.queue)
            .and_then(|queue| queue.identity.dead_letter.clone());

        if let Some(dead_letter) = target {
            // A missing dead-letter exchange drops the message.
            _ = self.route(&dead_letter.exchange, &dead_letter.routing_key, unacked.message);
        }
    }

    fn settle(&mut self, channel: u64, tag: u64) -> anyhow::Result<Unacked> {
        self.check_channel(channel)?;
        match self.unacked.get(&tag) {
            Some(unacked) if unacked.channel == channel => {}
            _ => bail!("PRECONDITION_FAILED - unknown delivery tag {tag}"),
        }
        let unacked = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| anyhow!("unknown delivery tag {tag}"))?;
        if let Some(state) = self.channels.get_mut(&channel) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to the broker.
    pub async fn connect(&self) -> Result<InMemoryConnection> {
        let mut inner = self.state.inner.lock().await;
        if inner.unavailable {
            return Err(QueueError::Connection(anyhow!("connection refused")));
        }
        let id = inner.next_id();
        inner.connections.insert(id);

        Ok(InMemoryConnection {
            broker: self.clone(),
            id,
        })
    }

    /// Simulate the broker going away (or coming back).
    ///
    /// Going away drops every connection and channel; their unsettled
    /// deliveries are requeued and open consumer streams yield an error.
    pub async fn set_available(&self, available: bool) {
        let mut inner = self.state.inner.lock().await;
        inner.unavailable = !available;
        if !available {
            let channels: Vec<u64> = inner.channels.keys().copied().collect();
            for channel in channels {
                inner.close_channel(channel);
            }
            inner.connections.clear();
        }
        drop(inner);
        self.state.notify.notify_waiters();
    }

    /// Number of messages ready for delivery, or `None` if the queue does not
    /// exist.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let inner = self.state.inner.lock().await;
        inner.queues.get(queue).map(|queue| queue.ready.len())
    }

    /// Number of messages from `queue` delivered but not yet settled.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock().await;
        inner
            .unacked
            .values()
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    /// Total number of publish calls that reached the broker.
    pub async fn publish_count(&self) -> u64 {
        self.state.inner.lock().await.publishes
    }

    /// Whether `queue` is bound to `exchange`.
    pub async fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        let inner = self.state.inner.lock().await;
        inner
            .exchanges
            .get(exchange)
            .is_some_and(|state| state.bindings.iter().any(|(bound, _)| bound == queue))
    }
}

/// A connection to an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self, prefetch: u16) -> Result<Self::Channel> {
        let mut inner = self.broker.state.inner.lock().await;
        if inner.unavailable || !inner.connections.contains(&self.id) {
            return Err(QueueError::Channel(anyhow!("connection is closed")));
        }
        let id = inner.next_id();
        inner.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch,
                in_flight: 0,
                consumers: HashSet::new(),
            },
        );

        Ok(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        })
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.broker.state.inner.lock().await;
        if !inner.connections.remove(&self.id) {
            return Err(QueueError::Connection(anyhow!("connection is already closed")));
        }
        let channels: Vec<u64> = inner
            .channels
            .iter()
            .filter(|(_, state)| state.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            inner.close_channel(channel);
        }
        drop(inner);
        self.broker.state.notify.notify_waiters();

        Ok(())
    }
}

/// A channel on an [`InMemoryConnection`].
#[derive(Clone)]
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

impl InMemoryChannel {
    /// Runs `f` against the broker state, closing this channel if it fails,
    /// the way a broker closes a channel on a channel-level exception.
    async fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut inner = self.broker.state.inner.lock().await;
        inner.check_channel(self.id)?;
        let result = f(&mut *inner);
        if result.is_err() {
            inner.close_channel(self.id);
        }
        drop(inner);
        self.broker.state.notify.notify_waiters();
        result
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    type Acker = InMemoryAcker;

    async fn declare_exchange(&self, exchange: &ExchangeIdentity) -> Result<()> {
        self.with_inner(|inner| {
            if let Some(existing) = inner.exchanges.get(&exchange.name) {
                if existing.identity != *exchange {
                    bail!(
                        "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                        exchange.name
                    );
                }
                return Ok(());
            }
            inner.exchanges.insert(
                exchange.name.clone(),
                ExchangeState {
                    identity: exchange.clone(),
                    bindings: Vec::new(),
                },
            );
            Ok(())
        })
        .await
        .map_err(|e| QueueError::declaration("exchange", &exchange.name, e))
    }

    async fn declare_queue(&self, queue: &QueueIdentity) -> Result<()> {
        self.with_inner(|inner| {
            if queue.queue_type == QueueType::Quorum
                && (!queue.durable || queue.exclusive || queue.auto_delete)
            {
                bail!(
                    "PRECONDITION_FAILED - invalid property for quorum queue '{}'",
                    queue.name
                );
            }
            if let Some(existing) = inner.queues.get(&queue.name) {
                if existing.identity != *queue {
                    bail!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                        queue.name
                    );
                }
                return Ok(());
            }
            inner.queues.insert(
                queue.name.clone(),
                QueueState {
                    identity: queue.clone(),
                    ready: VecDeque::new(),
                },
            );
            Ok(())
        })
        .await
        .map_err(|e| QueueError::declaration("queue", &queue.name, e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_inner(|inner| {
            if !inner.queues.contains_key(queue) {
                bail!("NOT_FOUND - no queue '{queue}'");
            }
            let state = inner
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| anyhow!("NOT_FOUND - no exchange '{exchange}'"))?;
            let binding = (queue.to_string(), routing_key.to_string());
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
        .await
        .map_err(|e| QueueError::binding(queue, exchange, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        let message = Message {
            body: payload.to_vec(),
            content_type: Some(properties.content_type.to_string()),
            persistent: properties.delivery_mode == DeliveryMode::Persistent,
            delivery_count: 0,
            redelivered: false,
        };

        self.with_inner(|inner| {
            inner.publishes += 1;
            inner.route(exchange, routing_key, message)
        })
        .await
        .map_err(QueueError::Delivery)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<InMemoryAcker>> {
        let channel = self.id;
        self.with_inner(|inner| {
            if !inner.queues.contains_key(queue) {
                bail!("NOT_FOUND - no queue '{queue}'");
            }
            if let Some(state) = inner.channels.get_mut(&channel) {
                state.consumers.insert(consumer_tag.to_string());
            }
            Ok(())
        })
        .await
        .map_err(QueueError::Channel)?;

        let cursor = Cursor {
            broker: self.broker.clone(),
            channel,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            done: false,
        };

        Ok(futures::stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next().await?;
            Some((item, cursor))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let channel = self.id;
        self.with_inner(|inner| {
            if let Some(state) = inner.channels.get_mut(&channel) {
                state.consumers.remove(consumer_tag);
            }
            Ok(())
        })
        .await
        .map_err(QueueError::Channel)
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.broker.state.inner.lock().await;
        inner
            .check_channel(self.id)
            .map_err(QueueError::Channel)?;
        inner.close_channel(self.id);
        drop(inner);
        self.broker.state.notify.notify_waiters();

        Ok(())
    }
}

/// Pulls deliveries for one consumer.
///
/// # Design
/// The cursor parks on the broker's [`Notify`] until a state change might let
/// it make progress: a publish, a settlement freeing prefetch capacity, a
/// cancellation or a closed channel. The `Notified` future is created before
/// the state is inspected so that no wake-up can slip in between.
struct Cursor {
    broker: InMemoryBroker,
    channel: u64,
    queue: String,
    consumer_tag: String,
    done: bool,
}

impl Cursor {
    async fn next(&mut self) -> Option<Result<Delivery<InMemoryAcker>>> {
        if self.done {
            return None;
        }

        loop {
            let notified = self.broker.state.notify.notified();
            {
                let mut inner = self.broker.state.inner.lock().await;
                if let Err(err) = inner.check_channel(self.channel) {
                    self.done = true;
                    return Some(Err(QueueError::Delivery(err)));
                }

                let (active, has_capacity) = match inner.channels.get(&self.channel) {
                    Some(state) => (
                        state.consumers.contains(&self.consumer_tag),
                        state.prefetch == 0 || state.in_flight < usize::from(state.prefetch),
                    ),
                    None => (false, false),
                };
                if !active {
                    self.done = true;
                    return None;
                }

                let message = if has_capacity {
                    inner.queues.get_mut(&self.queue).and_then(|queue| {
                        let counted = queue.identity.queue_type == QueueType::Quorum;
                        queue.ready.pop_front().map(|message| (message, counted))
                    })
                } else {
                    None
                };

                if let Some((message, counted)) = message {
                    let tag = inner.next_id();
                    if let Some(state) = inner.channels.get_mut(&self.channel) {
                        state.in_flight += 1;
                    }
                    inner.unacked.insert(
                        tag,
                        Unacked {
                            queue: self.queue.clone(),
                            channel: self.channel,
                            message: message.clone(),
                        },
                    );

                    return Some(Ok(Delivery {
                        data: message.body,
                        delivery_tag: tag,
                        redelivered: message.redelivered,
                        attempt: attempt_number(
                            counted.then_some(message.delivery_count),
                            message.redelivered,
                        ),
                        content_type: message.content_type,
                        persistent: message.persistent,
                        acker: InMemoryAcker {
                            broker: self.broker.clone(),
                            channel: self.channel,
                            tag,
                        },
                    }));
                }
            }
            notified.await;
        }
    }
}

/// An acker for an [`InMemoryChannel`] delivery.
pub struct InMemoryAcker {
    broker: InMemoryBroker,
    channel: u64,
    tag: u64,
}

impl fmt::Debug for InMemoryAcker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryAcker")
            .field("channel", &self.channel)
            .field("tag", &self.tag)
            .finish()
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut inner = self.broker.state.inner.lock().await;
        inner
            .settle(self.channel, self.tag)
            .map_err(QueueError::Delivery)?;
        drop(inner);
        self.broker.state.notify.notify_waiters();

        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut inner = self.broker.state.inner.lock().await;
        let unacked = inner
            .settle(self.channel, self.tag)
            .map_err(QueueError::Delivery)?;
        if requeue {
            inner.requeue(unacked);
        } else {
            inner.dead_letter(unacked);
        }
        drop(inner);
        self.broker.state.notify.notify_waiters();

        Ok(())
    }
}

#[cfg(test)]
mod helpers {
    use std::time::Duration;

    use futures::Future;

    use super::*;

    pub(super) const PERSISTENT: PublishProperties = PublishProperties {
        delivery_mode: DeliveryMode::Persistent,
        content_type: "application/json",
    };

    pub(super) async fn with_timeout<O, F: Future<Output = O>>(fut: F) -> Option<O> {
        tokio::time::timeout(Duration::from_millis(50), fut).await.ok()
    }

    pub(super) async fn channel_with_queue(
        broker: &InMemoryBroker,
        queue: &str,
    ) -> InMemoryChannel {
        let channel = broker.connect().await.unwrap().open_channel(10).await.unwrap();
        channel
            .declare_queue(&QueueIdentity::durable(queue))
            .await
            .unwrap();
        channel
    }

    pub(super) async fn next_delivery(
        stream: &mut DeliveryStream<InMemoryAcker>,
    ) -> Option<Delivery<InMemoryAcker>> {
        with_timeout(stream.next())
            .await
            .flatten()
            .map(|delivery| delivery.unwrap())
    }
}

#[cfg(test)]
mod declaration {
    use super::helpers::*;
    use super::*;

    #[tokio::test]
    async fn identical_redeclaration_is_a_noop() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker, "q").await;
        channel.publish("", "q", b"1", PERSISTENT).await.unwrap();

        channel
            .declare_queue(&QueueIdentity::durable("q"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("q").await, Some(1));
    }

    #[tokio::test]
    async fn conflicting_redeclaration_fails_and_closes_channel() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker, "q").await;

        let mut transient = QueueIdentity::durable("q");
        transient.durable = false;
        let err = channel.declare_queue(&transient).await.unwrap_err();
        assert!(matches!(err, QueueError::Declaration { kind: "queue", .. }));

        let err = channel
            .publish("", "q", b"1", PERSISTENT)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn quorum_queue_must_be_shared() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap().open_channel(1).await.unwrap();
        let mut queue = QueueIdentity::quorum("q");
        queue.exclusive = true;

        let err = channel.declare_queue(&queue).await.unwrap_err();
        assert!(matches!(err, QueueError::Declaration { kind: "queue", .. }));
    }

    #[tokio::test]
    async fn classic_and_quorum_queues_conflict() {
        let broker = InMemoryBroker::new();
        channel_with_queue(&broker, "q").await;

        let channel = broker.connect().await.unwrap().open_channel(1).await.unwrap();
        let err = channel
            .declare_queue(&QueueIdentity::quorum("q"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Declaration { kind: "queue", .. }));
    }

    #[tokio::test]
    async fn conflicting_exchange_kind_fails() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap().open_channel(1).await.unwrap();
        let mut exchange = ExchangeIdentity::dead_letter();
        channel.declare_exchange(&exchange).await.unwrap();
        channel.declare_exchange(&exchange).await.unwrap();

        exchange.kind = ExchangeKind::Fanout;
        assert!(channel.declare_exchange(&exchange).await.is_err());
    }

    #[tokio::test]
    async fn binding_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        let channel = channel_with_queue(&broker, "q").await;
        let err = channel.bind_queue("q", "missing", "").await.unwrap_err();
        assert!(matches!(err, QueueError::Binding { .. }));
    }
}
