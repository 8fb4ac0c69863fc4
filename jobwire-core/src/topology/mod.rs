//! Queue and exchange topology.
//!
//! The set of queues and exchanges is closed and known at compile time. Each
//! [`QueueCategory`] maps to exactly one queue and, for categories that need
//! broadcast semantics, one fan-out [`Exchange`]. Broadcast categories are
//! _host scoped_: every node declares its own `<host>+<queue>` queue and binds
//! it to the exchange, so a single publish reaches every node (a key creation
//! request, for example, must land in every node's local key store).
//!
//! All other categories use the default exchange, which routes by queue name
//! and gives each message to exactly one consumer.
//!
//! Work queues are quorum queues. The broker then counts redeliveries in the
//! `x-delivery-count` header, which bounds how often a failing job is retried.
//!
//! Declarations are idempotent: re-declaring an entity with identical
//! parameters is a no-op, while conflicting parameters fail with
//! [`QueueError::Declaration`].
use std::{fmt, str::FromStr};

use tracing::{info, instrument};

use crate::{
    error::{QueueError, Result},
    queue::Channel,
};

/// Name of the direct exchange rejected messages are routed through.
pub const DEAD_LETTER_EXCHANGE: &str = "jobwire.dead-letter";
const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// The closed set of job categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueCategory {
    DatabaseFileAdd,
    IpfsPin,
    IpfsFile,
    EmailSend,
    IpnsEntry,
    IpfsKeyCreation,
    IpfsClusterPin,
}

impl QueueCategory {
    pub const ALL: [Self; 7] = [
        Self::DatabaseFileAdd,
        Self::IpfsPin,
        Self::IpfsFile,
        Self::EmailSend,
        Self::IpnsEntry,
        Self::IpfsKeyCreation,
        Self::IpfsClusterPin,
    ];

    /// The logical queue name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseFileAdd => "dfa-queue",
            Self::IpfsPin => "ipfs-pin-queue",
            Self::IpfsFile => "ipfs-file-queue",
            Self::EmailSend => "email-send-queue",
            Self::IpnsEntry => "ipns-entry-queue",
            Self::IpfsKeyCreation => "ipfs-key-creation-queue",
            Self::IpfsClusterPin => "ipfs-cluster-add-pin-queue",
        }
    }

    /// The fan-out exchange this category's queue is bound to, if any.
    pub fn exchange(&self) -> Option<Exchange> {
        match self {
            Self::IpfsPin => Some(Exchange::Pin),
            Self::IpfsKeyCreation => Some(Exchange::IpfsKey),
            _ => None,
        }
    }

    /// Whether queue names for this category are prefixed with the host
    /// identity.
    pub fn is_host_scoped(&self) -> bool {
        self.exchange().is_some()
    }
}

impl fmt::Display for QueueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueCategory {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| QueueError::InvalidCategory(s.to_string()))
    }
}

/// The allow-list of exchanges recognized by this deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Exchange {
    Pin,
    PinRemoval,
    IpfsKey,
}

impl Exchange {
    pub const ALL: [Self; 3] = [Self::Pin, Self::PinRemoval, Self::IpfsKey];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pin => "ipfs-pin",
            Self::PinRemoval => "ipfs-pin-removal",
            Self::IpfsKey => "ipfs-key",
        }
    }

    /// All recognized exchanges broadcast to every bound queue.
    pub fn kind(&self) -> ExchangeKind {
        ExchangeKind::Fanout
    }

    pub fn identity(&self) -> ExchangeIdentity {
        ExchangeIdentity {
            name: self.as_str().to_string(),
            kind: self.kind(),
            durable: true,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|exchange| exchange.as_str() == s)
            .ok_or_else(|| QueueError::InvalidExchange(s.to_string()))
    }
}

/// How an exchange routes messages to its bound queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Every bound queue receives a copy.
    Fanout,
    /// Queues bound with a matching routing key receive the message.
    #[default]
    Direct,
}

/// Declaration parameters for an exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeIdentity {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeIdentity {
    /// The exchange dead-lettered messages are published through.
    pub fn dead_letter() -> Self {
        Self {
            name: DEAD_LETTER_EXCHANGE.to_string(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

/// Where the broker routes messages rejected without requeue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

/// The broker-side queue implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueType {
    #[default]
    Classic,
    /// Replicated, and reports the number of earlier deliveries of each
    /// message. Must be durable, shared and non-auto-deleting.
    Quorum,
}

/// Declaration parameters for a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueIdentity {
    pub name: String,
    pub queue_type: QueueType,
    /// Survives a broker restart.
    pub durable: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
    /// Restricted to the declaring connection.
    pub exclusive: bool,
    pub dead_letter: Option<DeadLetter>,
}

impl QueueIdentity {
    /// A durable, shared, non-auto-deleting classic queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_type: QueueType::Classic,
            durable: true,
            auto_delete: false,
            exclusive: false,
            dead_letter: None,
        }
    }

    /// A durable quorum queue.
    pub fn quorum(name: impl Into<String>) -> Self {
        Self {
            queue_type: QueueType::Quorum,
            ..Self::durable(name)
        }
    }

    /// The queue for `category`, prefixed with `host` when host scoped.
    pub fn for_category(category: QueueCategory, host: Option<&str>) -> Result<Self> {
        if !category.is_host_scoped() {
            return Ok(Self::quorum(category.as_str()));
        }

        match host {
            Some(host) if !host.is_empty() => Ok(Self::quorum(format!("{host}+{category}"))),
            _ => Err(QueueError::Config(format!(
                "queue `{category}` is host scoped but no host identity was provided"
            ))),
        }
    }

    /// Routes messages rejected from this queue to its dead-letter queue.
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = Some(DeadLetter {
            exchange: DEAD_LETTER_EXCHANGE.to_string(),
            routing_key: self.name.clone(),
        });
        self
    }

    /// The queue holding messages dead-lettered from this one.
    pub fn dead_letter_queue(&self) -> QueueIdentity {
        QueueIdentity::durable(format!("{}{DEAD_LETTER_SUFFIX}", self.name))
    }
}

/// The declarations a manager performs for its category.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub category: QueueCategory,
    pub queue: QueueIdentity,
    pub exchange: Option<ExchangeIdentity>,
}

impl Topology {
    pub fn for_category(
        category: QueueCategory,
        host: Option<&str>,
        dead_letter: bool,
    ) -> Result<Self> {
        let queue = QueueIdentity::for_category(category, host)?;
        let queue = if dead_letter {
            queue.with_dead_letter()
        } else {
            queue
        };

        Ok(Self {
            category,
            queue,
            exchange: category.exchange().map(|exchange| exchange.identity()),
        })
    }

    /// Declares every allow-listed exchange and, for consumers, the
    /// category's queue, dead-letter queue and binding.
    ///
    /// Exchanges are declared first so that publish-only processes can route
    /// to any of them without a queue of their own. Nothing is declared after
    /// this returns; publishing never creates topology.
    #[instrument(skip_all, fields(queue = %self.queue.name), level = "debug")]
    pub async fn declare<C: Channel>(&self, channel: &C, declare_queue: bool) -> Result<()> {
        for exchange in Exchange::ALL {
            let exchange = exchange.identity();
            channel.declare_exchange(&exchange).await?;
            info!(exchange = %exchange.name, "exchange declared");
        }

        if !declare_queue {
            return Ok(());
        }

        if let Some(dead_letter) = &self.queue.dead_letter {
            let dead_letter_queue = self.queue.dead_letter_queue();
            channel
                .declare_exchange(&ExchangeIdentity::dead_letter())
                .await?;
            channel.declare_queue(&dead_letter_queue).await?;
            channel
                .bind_queue(
                    &dead_letter_queue.name,
                    &dead_letter.exchange,
                    &dead_letter.routing_key,
                )
                .await?;
            info!(queue = %dead_letter_queue.name, "dead-letter queue declared");
        }

        channel.declare_queue(&self.queue).await?;
        info!("queue declared");

        self.bind(channel).await
    }

    /// Binds the queue to the category's exchange. A no-op for categories
    /// without one; idempotent otherwise.
    pub async fn bind<C: Channel>(&self, channel: &C) -> Result<()> {
        if let Some(exchange) = &self.exchange {
            channel
                .bind_queue(&self.queue.name, &exchange.name, "")
                .await?;
            info!(queue = %self.queue.name, exchange = %exchange.name, "queue bound");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn category_names_round_trip() {
        for category in QueueCategory::ALL {
            assert_eq!(category.as_str().parse::<QueueCategory>().unwrap(), category);
        }
    }

    #[test]
    fn unknown_category() {
        let err = "ipfs-unpin-queue".parse::<QueueCategory>().unwrap_err();
        assert_eq!(err.to_string(), "invalid queue name: `ipfs-unpin-queue`");
    }

    #[test]
    fn unknown_exchange() {
        assert!(matches!(
            "ipfs-everything".parse::<Exchange>(),
            Err(QueueError::InvalidExchange(_))
        ));
        assert_eq!("ipfs-pin-removal".parse::<Exchange>().unwrap(), Exchange::PinRemoval);
    }

    #[test]
    fn broadcast_categories_are_host_scoped() {
        let queue =
            QueueIdentity::for_category(QueueCategory::IpfsKeyCreation, Some("node-1")).unwrap();
        assert_eq!(queue.name, "node-1+ipfs-key-creation-queue");
        assert_eq!(queue.queue_type, QueueType::Quorum);
        assert!(queue.durable && !queue.auto_delete && !queue.exclusive);

        assert!(QueueIdentity::for_category(QueueCategory::IpfsPin, None).is_err());

        let queue = QueueIdentity::for_category(QueueCategory::EmailSend, Some("node-1")).unwrap();
        assert_eq!(queue.name, "email-send-queue");
    }

    #[test]
    fn topology_for_category() {
        let topology = Topology::for_category(QueueCategory::IpfsPin, Some("n1"), true).unwrap();
        assert_eq!(topology.exchange, Some(Exchange::Pin.identity()));
        assert_eq!(
            topology.queue.dead_letter,
            Some(DeadLetter {
                exchange: DEAD_LETTER_EXCHANGE.to_string(),
                routing_key: "n1+ipfs-pin-queue".to_string(),
            })
        );
        let dead_letter_queue = topology.queue.dead_letter_queue();
        assert_eq!(dead_letter_queue.name, "n1+ipfs-pin-queue.dead-letter");
        assert_eq!(dead_letter_queue.queue_type, QueueType::Classic);

        let topology = Topology::for_category(QueueCategory::IpfsFile, None, false).unwrap();
        assert_eq!(topology.exchange, None);
        assert_eq!(topology.queue.dead_letter, None);
    }
}
