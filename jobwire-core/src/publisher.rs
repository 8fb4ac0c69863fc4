//! Publishing job payloads.
//!
//! Two targets are supported:
//! - the manager's own queue, through the default exchange. Each message is
//!   handed to exactly one consumer of that queue. A publisher cannot address
//!   a host-scoped queue this way, since its own `<host>+<queue>` has no
//!   consumer; broadcast categories are published to their exchange instead.
//! - a named fan-out exchange from the [`Exchange`] allow-list. Every queue
//!   bound to the exchange receives its own copy.
//!
//! Messages are always persistent and stamped with the serializer's content
//! type. A publish returns once the broker has confirmed the message; retrying
//! a failed publish is up to the caller and may produce duplicates.
//!
//! ```
//! use jobwire::{
//!     manager::{ManagerOptions, QueueManager, Role},
//!     queue::in_memory::InMemoryBroker,
//!     topology::QueueCategory,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::new();
//!     let options = ManagerOptions::new(QueueCategory::EmailSend, Role::Consumer);
//!     let manager = QueueManager::initialize(broker.connect().await?, options).await?;
//!
//!     manager.publish(&json!({"to": "ops@example.com"})).await?;
//!     assert_eq!(broker.queue_depth("email-send-queue").await, Some(1));
//!     Ok(())
//! }
//! ```
use serde::Serialize;
use tracing::{error, instrument};

use crate::{
    error::{QueueError, Result},
    manager::{QueueManager, Role},
    queue::{Channel, Connection, DeliveryMode, PublishProperties},
    topology::Exchange,
};

const DEFAULT_EXCHANGE: &str = "";

impl<C: Connection> QueueManager<C> {
    fn publish_properties(&self) -> PublishProperties {
        PublishProperties {
            delivery_mode: DeliveryMode::Persistent,
            content_type: self.serializer().content_type(),
        }
    }

    /// Publish `payload` to this manager's queue.
    ///
    /// Fails with [`QueueError::Config`] on a publisher for a host-scoped
    /// category: the default exchange would route the message to the
    /// publisher's own queue, which nothing declares or consumes.
    #[instrument(skip_all, fields(queue = %self.queue().name), level = "debug")]
    pub async fn publish<T: Serialize + ?Sized + Sync>(&self, payload: &T) -> Result<()> {
        if self.role() == Role::Publisher {
            if let Some(exchange) = self.category().exchange() {
                error!("refusing to publish to unconsumed queue");
                return Err(QueueError::Config(format!(
                    "queue `{}` is host scoped; publish to exchange `{exchange}` instead",
                    self.category()
                )));
            }
        }

        let bytes = self.serializer().to_bytes(payload).map_err(|e| {
            error!("failed to encode payload: {e}");
            e
        })?;

        self.channel()
            .publish(
                DEFAULT_EXCHANGE,
                &self.queue().name,
                &bytes,
                self.publish_properties(),
            )
            .await
            .map_err(|e| {
                error!("failed to publish message: {e}");
                e
            })
    }

    /// Publish `payload` to the named exchange.
    ///
    /// The name is checked against the allow-list before anything is sent to
    /// the broker. Every allow-listed exchange was declared when the manager
    /// was initialized, so a manager may broadcast on exchanges other than
    /// its own category's.
    #[instrument(skip(self, payload), level = "debug")]
    pub async fn publish_to_exchange<T: Serialize + ?Sized + Sync>(
        &self,
        payload: &T,
        exchange: &str,
    ) -> Result<()> {
        let exchange: Exchange = exchange.parse().map_err(|e| {
            error!("refusing to publish: {e}");
            e
        })?;
        let bytes = self.serializer().to_bytes(payload).map_err(|e| {
            error!("failed to encode payload: {e}");
            e
        })?;

        self.channel()
            .publish(exchange.as_str(), "", &bytes, self.publish_properties())
            .await
            .map_err(|e| {
                error!("failed to publish message: {e}");
                e
            })
    }
}
