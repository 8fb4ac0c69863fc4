//! Error types.
//!
//! Failures in a broker-backed system fall into two camps. Transport and
//! topology failures (the broker is unreachable, a channel died, a queue was
//! declared with conflicting parameters) are never retried here; they are
//! surfaced to the caller, which owns reconnection policy. Caller mistakes
//! (an unknown exchange or queue name) are rejected before any broker
//! interaction takes place.
//!
//! Handler failures are a separate type,
//! [`HandlerError`](crate::dispatcher::HandlerError), because they never
//! escape the dispatch loop: they resolve to an acknowledgement outcome.
use thiserror::Error;

/// Shorthand for results produced by this crate.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Errors produced while talking to the broker or validating identities.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The broker could not be reached. Fatal at start up.
    #[error("failed to connect to broker: {0}")]
    Connection(#[source] anyhow::Error),

    /// A channel could not be opened or configured.
    #[error("channel error: {0}")]
    Channel(#[source] anyhow::Error),

    /// A queue or exchange could not be declared, usually because an entity
    /// with the same name already exists with different parameters.
    #[error("failed to declare {kind} `{name}`: {source}")]
    Declaration {
        kind: &'static str,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// A queue could not be bound to an exchange.
    #[error("failed to bind queue `{queue}` to exchange `{exchange}`: {source}")]
    Binding {
        queue: String,
        exchange: String,
        #[source]
        source: anyhow::Error,
    },

    /// The exchange name is not one of the recognized exchanges.
    #[error("invalid exchange name provided: `{0}`")]
    InvalidExchange(String),

    /// The queue name is not one of the recognized categories, or no handler
    /// is registered for it.
    #[error("invalid queue name: `{0}`")]
    InvalidCategory(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[source] anyhow::Error),

    /// A publish, ack or nack failed because the channel or connection is
    /// gone, or the broker refused the message.
    #[error("delivery error: {0}")]
    Delivery(#[source] anyhow::Error),

    /// The process configuration is incomplete or unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    pub(crate) fn declaration(
        kind: &'static str,
        name: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Declaration {
            kind,
            name: name.into(),
            source: source.into(),
        }
    }

    pub(crate) fn binding(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Binding {
            queue: queue.into(),
            exchange: exchange.into(),
            source: source.into(),
        }
    }

    /// Whether the error indicates the transport itself is gone, as opposed
    /// to a rejected request on a healthy channel.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Channel(_) | Self::Delivery(_)
        )
    }
}

#[cfg(test)]
mod test {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn declaration_message_names_entity() {
        let err =
            QueueError::declaration("queue", "dfa-queue", anyhow!("inequivalent arg 'durable'"));
        assert_eq!(
            err.to_string(),
            "failed to declare queue `dfa-queue`: inequivalent arg 'durable'"
        );
        assert!(!err.is_transport());
    }

    #[test]
    fn invalid_exchange_message() {
        let err = QueueError::InvalidExchange("nope".to_string());
        assert_eq!(err.to_string(), "invalid exchange name provided: `nope`");
    }

    #[test]
    fn delivery_is_transport() {
        assert!(QueueError::Delivery(anyhow!("channel closed")).is_transport());
    }
}
