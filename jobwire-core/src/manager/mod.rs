//! Connection and channel lifecycle for a single job category.
//!
//! A [`QueueManager`] owns exactly one broker connection and exactly one
//! channel. The channel carries topology declarations, publishes and the
//! consumer stream alike. Initialization declares the category's topology
//! (see [`Topology::declare`]) according to the manager's [`Role`]; once it
//! returns, the topology is fixed for the manager's lifetime.
//!
//! # Example
//!
//! ```
//! use jobwire::{
//!     manager::{ManagerOptions, QueueManager, Role},
//!     queue::in_memory::InMemoryBroker,
//!     topology::QueueCategory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::new();
//!     let options = ManagerOptions::new(QueueCategory::IpfsPin, Role::Consumer).host_id("node-1");
//!     let manager = QueueManager::initialize(broker.connect().await?, options).await?;
//!     assert_eq!(manager.queue().name, "node-1+ipfs-pin-queue");
//!
//!     let report = manager.close().await;
//!     assert!(report.is_clean());
//!     Ok(())
//! }
//! ```
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::{Config, DEFAULT_PREFETCH},
    error::{QueueError, Result},
    queue::{amqp::AMQPConnection, Channel, Connection},
    serializer::Serializer,
    topology::{ExchangeIdentity, QueueCategory, QueueIdentity, Topology},
};

/// What a manager is used for, which decides how much topology it declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Declares only the allow-listed exchanges. Publish-only processes never
    /// create queues they do not consume.
    Publisher,
    /// Declares the exchanges, the dead-letter queue, the work queue and the
    /// binding between them.
    Consumer,
}

/// Parameters for [`QueueManager::initialize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerOptions {
    pub category: QueueCategory,
    pub role: Role,
    pub prefetch: u16,
    pub serializer: Serializer,
    pub host_id: Option<String>,
    pub dead_letter: bool,
}

impl ManagerOptions {
    pub fn new(category: QueueCategory, role: Role) -> Self {
        Self {
            category,
            role,
            prefetch: DEFAULT_PREFETCH,
            serializer: Serializer::default(),
            host_id: None,
            dead_letter: true,
        }
    }

    pub fn host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Options for the category named in `config`.
    pub fn from_config(config: &Config, role: Role) -> Result<Self> {
        Ok(Self {
            category: config.category()?,
            role,
            prefetch: config.prefetch,
            serializer: Serializer::from(config),
            host_id: config.host_id.clone(),
            dead_letter: config.dead_letter,
        })
    }
}

/// Owns the connection, the channel and the declared topology of one
/// category.
pub struct QueueManager<C: Connection> {
    connection: C,
    channel: C::Channel,
    topology: Topology,
    role: Role,
    prefetch: u16,
    serializer: Serializer,
}

impl<C: Connection> QueueManager<C> {
    /// Opens the channel and declares the topology for `options.category`.
    ///
    /// Any failure closes `connection` before the error is returned, so a
    /// failed initialization leaves nothing open behind it.
    #[instrument(
        skip_all,
        fields(category = %options.category, role = ?options.role),
        level = "debug"
    )]
    pub async fn initialize(connection: C, options: ManagerOptions) -> Result<Self> {
        let setup = async {
            let topology = Topology::for_category(
                options.category,
                options.host_id.as_deref(),
                options.dead_letter,
            )?;
            let channel = connection.open_channel(options.prefetch).await?;

            if let Err(e) = topology
                .declare(&channel, options.role == Role::Consumer)
                .await
            {
                // The broker may already have closed the channel.
                _ = channel.close().await;
                return Err(e);
            }

            Ok::<_, QueueError>((topology, channel))
        };

        let (topology, channel) = match setup.await {
            Ok(setup) => setup,
            Err(e) => {
                error!("failed to initialize queue manager: {e}");
                if let Err(close) = connection.close().await {
                    warn!("failed to close connection after initialization error: {close}");
                }
                return Err(e);
            }
        };

        info!(queue = %topology.queue.name, "queue manager initialized");

        Ok(Self {
            connection,
            channel,
            topology,
            role: options.role,
            prefetch: options.prefetch,
            serializer: options.serializer,
        })
    }

    /// Replaces the channel with a fresh one on the same connection.
    ///
    /// The old channel is closed on a best-effort basis. Declared topology
    /// lives on the broker and is not re-declared.
    #[instrument(skip_all, fields(queue = %self.topology.queue.name), level = "debug")]
    pub async fn reopen_channel(&mut self) -> Result<()> {
        if let Err(e) = self.channel.close().await {
            debug!("previous channel did not close cleanly: {e}");
        }
        self.channel = self.connection.open_channel(self.prefetch).await?;
        info!("channel reopened");

        Ok(())
    }

    pub fn channel(&self) -> &C::Channel {
        &self.channel
    }

    pub fn category(&self) -> QueueCategory {
        self.topology.category
    }

    pub fn queue(&self) -> &QueueIdentity {
        &self.topology.queue
    }

    pub fn exchange(&self) -> Option<&ExchangeIdentity> {
        self.topology.exchange.as_ref()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Closes the channel, then the connection.
    ///
    /// Both are attempted regardless of the other's outcome, and both
    /// outcomes are returned.
    #[instrument(skip_all, fields(queue = %self.topology.queue.name), level = "debug")]
    pub async fn close(self) -> CloseReport {
        let channel = self.channel.close().await;
        let connection = self.connection.close().await;

        CloseReport {
            queue: self.topology.queue.name,
            channel,
            connection,
        }
    }
}

impl QueueManager<AMQPConnection> {
    /// Connects to `config.amqp_uri` and initializes the configured category.
    pub async fn connect(config: &Config, role: Role) -> Result<Self> {
        let options = ManagerOptions::from_config(config, role)?;
        let connection = AMQPConnection::connect(&config.amqp_uri).await?;

        Self::initialize(connection, options).await
    }
}

/// The outcome of [`QueueManager::close`].
#[derive(Debug)]
#[must_use]
pub struct CloseReport {
    pub queue: String,
    pub channel: Result<()>,
    pub connection: Result<()>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.channel.is_ok() && self.connection.is_ok()
    }

    /// Logs each outcome.
    pub fn log(&self) {
        match &self.channel {
            Ok(()) => info!(queue = %self.queue, "channel closed"),
            Err(e) => error!(queue = %self.queue, "failed to close channel: {e}"),
        }
        match &self.connection {
            Ok(()) => info!(queue = %self.queue, "connection closed"),
            Err(e) => error!(queue = %self.queue, "failed to close connection: {e}"),
        }
    }

    /// The channel error if there was one, else the connection error.
    pub fn into_result(self) -> Result<()> {
        self.channel.and(self.connection)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        queue::{in_memory::InMemoryBroker, DeliveryMode, PublishProperties},
        topology::{Exchange, DEAD_LETTER_EXCHANGE},
    };

    #[tokio::test]
    async fn consumer_declares_full_topology() {
        let broker = InMemoryBroker::new();
        let options =
            ManagerOptions::new(QueueCategory::IpfsKeyCreation, Role::Consumer).host_id("n1");
        let manager = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .unwrap();

        assert_eq!(manager.queue().name, "n1+ipfs-key-creation-queue");
        assert_eq!(manager.exchange(), Some(&Exchange::IpfsKey.identity()));
        assert_eq!(broker.queue_depth("n1+ipfs-key-creation-queue").await, Some(0));
        assert_eq!(
            broker.queue_depth("n1+ipfs-key-creation-queue.dead-letter").await,
            Some(0)
        );
        assert!(broker.is_bound("n1+ipfs-key-creation-queue", "ipfs-key").await);
        assert!(
            broker
                .is_bound("n1+ipfs-key-creation-queue.dead-letter", DEAD_LETTER_EXCHANGE)
                .await
        );

        assert!(manager.close().await.is_clean());
    }

    #[tokio::test]
    async fn publisher_skips_queue_declaration() {
        let broker = InMemoryBroker::new();
        let options = ManagerOptions::new(QueueCategory::IpfsPin, Role::Publisher).host_id("api");
        let manager = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("api+ipfs-pin-queue").await, None);
        // Every allow-listed exchange exists, so binding a consumer's queue
        // to any of them succeeds.
        let channel = broker.connect().await.unwrap().open_channel(1).await.unwrap();
        channel
            .declare_queue(&QueueIdentity::durable("other"))
            .await
            .unwrap();
        for exchange in Exchange::ALL {
            channel
                .bind_queue("other", exchange.as_str(), "")
                .await
                .unwrap();
        }

        assert!(manager.close().await.is_clean());
    }

    #[tokio::test]
    async fn host_scoped_category_without_host_fails() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let options = ManagerOptions::new(QueueCategory::IpfsPin, Role::Consumer);

        let err = QueueManager::initialize(connection.clone(), options)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Config(_)));
        // The connection was closed on the way out.
        assert!(connection.open_channel(1).await.is_err());
    }

    #[tokio::test]
    async fn conflicting_queue_parameters_fail_initialization() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap().open_channel(1).await.unwrap();
        // Declared by an older deployment without dead-letter arguments.
        channel
            .declare_queue(&QueueIdentity::quorum("dfa-queue"))
            .await
            .unwrap();

        let options = ManagerOptions::new(QueueCategory::DatabaseFileAdd, Role::Consumer);
        let err = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Declaration { kind: "queue", .. }));

        // Same parameters as the existing queue succeed.
        let options =
            ManagerOptions::new(QueueCategory::DatabaseFileAdd, Role::Consumer).dead_letter(false);
        let manager = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .unwrap();
        assert!(manager.close().await.is_clean());
    }

    #[tokio::test]
    async fn classic_work_queue_fails_initialization() {
        let broker = InMemoryBroker::new();
        let channel = broker.connect().await.unwrap().open_channel(1).await.unwrap();
        channel
            .declare_queue(&QueueIdentity::durable("email-send-queue"))
            .await
            .unwrap();

        let options =
            ManagerOptions::new(QueueCategory::EmailSend, Role::Consumer).dead_letter(false);
        let err = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Declaration { kind: "queue", .. }));
    }

    #[tokio::test]
    async fn reopened_channel_replaces_closed_one() {
        let broker = InMemoryBroker::new();
        let options = ManagerOptions::new(QueueCategory::EmailSend, Role::Consumer);
        let mut manager = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .unwrap();
        let properties = PublishProperties {
            delivery_mode: DeliveryMode::Persistent,
            content_type: "application/json",
        };

        manager.channel().close().await.unwrap();
        assert!(manager
            .channel()
            .publish("", "email-send-queue", b"{}", properties)
            .await
            .is_err());

        manager.reopen_channel().await.unwrap();
        manager
            .channel()
            .publish("", "email-send-queue", b"{}", properties)
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("email-send-queue").await, Some(1));
    }

    #[tokio::test]
    async fn close_reports_each_resource() {
        let broker = InMemoryBroker::new();
        let options = ManagerOptions::new(QueueCategory::IpnsEntry, Role::Consumer);
        let manager = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .unwrap();

        broker.set_available(false).await;

        let report = manager.close().await;
        assert!(!report.is_clean());
        assert!(matches!(report.channel, Err(QueueError::Channel(_))));
        assert!(matches!(report.connection, Err(QueueError::Connection(_))));
        assert!(report.into_result().is_err());
    }
}
