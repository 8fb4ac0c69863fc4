//! The contract between the dispatcher and per-category business logic.
//!
//! A [`JobHandler`] receives a decoded payload together with a
//! [`JobContext`] carrying the process-wide store handle and configuration.
//! Its result decides how the delivery is settled: success acknowledges it, a
//! [`HandlerError::Retryable`] failure requeues it (within the redelivery
//! budget) and a [`HandlerError::Permanent`] failure rejects it.
//!
//! ```
//! use jobwire::{
//!     async_trait,
//!     dispatcher::{HandlerError, HandlerRegistry, JobContext, JobHandler},
//!     topology::QueueCategory,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Email {
//!     to: String,
//! }
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler<()> for SendEmail {
//!     type Payload = Email;
//!
//!     async fn handle(&self, _ctx: &JobContext<()>, email: Email) -> Result<(), HandlerError> {
//!         if email.to.is_empty() {
//!             return Err(HandlerError::permanent(anyhow::anyhow!("no recipient")));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let registry = HandlerRegistry::new().register(QueueCategory::EmailSend, SendEmail);
//! assert!(registry.contains(QueueCategory::EmailSend));
//! ```
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::Config,
    error::{QueueError, Result},
    serializer::{Serializable, Serializer},
    topology::QueueCategory,
};

/// A failed job, classified by whether trying again could help.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The job may succeed on another attempt (a downstream service was
    /// unavailable, a lock was contended).
    #[error("retryable failure: {0}")]
    Retryable(#[source] anyhow::Error),
    /// The job will never succeed (the referenced record does not exist, the
    /// payload is semantically invalid).
    #[error("permanent failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl HandlerError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Shared collaborators handed to every handler invocation.
pub struct JobContext<S> {
    pub store: Arc<S>,
    pub config: Arc<Config>,
}

impl<S> JobContext<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self {
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }
}

impl<S> Clone for JobContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

/// Business logic for one job category.
#[async_trait]
pub trait JobHandler<S: Send + Sync + 'static>: Send + Sync + 'static {
    /// The payload shape this category's messages decode into.
    type Payload: Serializable;

    async fn handle(&self, ctx: &JobContext<S>, payload: Self::Payload) -> Result<(), HandlerError>;
}

/// What became of a single delivery.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Failed(HandlerError),
    /// The payload could not be decoded; the handler was never invoked.
    Undecodable(QueueError),
}

/// A handler with its payload type erased, so handlers for different
/// categories can share one table.
#[async_trait]
pub(crate) trait ErasedHandler<S>: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &JobContext<S>,
        serializer: Serializer,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Outcome;
}

struct Erased<H>(H);

#[async_trait]
impl<S, H> ErasedHandler<S> for Erased<H>
where
    S: Send + Sync + 'static,
    H: JobHandler<S>,
{
    async fn dispatch(
        &self,
        ctx: &JobContext<S>,
        serializer: Serializer,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Outcome {
        let payload = serializer
            .check_content_type(content_type)
            .and_then(|()| serializer.from_bytes::<H::Payload>(data));

        match payload {
            Ok(payload) => match self.0.handle(ctx, payload).await {
                Ok(()) => Outcome::Completed,
                Err(e) => Outcome::Failed(e),
            },
            Err(e) => Outcome::Undecodable(e),
        }
    }
}

/// Maps each category to its handler. Built once at start up.
pub struct HandlerRegistry<S> {
    handlers: HashMap<QueueCategory, Arc<dyn ErasedHandler<S>>>,
}

impl<S: Send + Sync + 'static> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `category`, replacing any previous one.
    pub fn register<H: JobHandler<S>>(mut self, category: QueueCategory, handler: H) -> Self {
        self.handlers.insert(category, Arc::new(Erased(handler)));
        self
    }

    pub fn contains(&self, category: QueueCategory) -> bool {
        self.handlers.contains_key(&category)
    }

    pub(crate) fn get(&self, category: QueueCategory) -> Result<Arc<dyn ErasedHandler<S>>> {
        self.handlers
            .get(&category)
            .cloned()
            .ok_or_else(|| QueueError::InvalidCategory(category.to_string()))
    }
}

impl<S: Send + Sync + 'static> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use anyhow::anyhow;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        name: String,
    }

    struct Publish;

    #[async_trait]
    impl JobHandler<()> for Publish {
        type Payload = Entry;

        async fn handle(&self, _ctx: &JobContext<()>, entry: Entry) -> Result<(), HandlerError> {
            match entry.name.as_str() {
                "" => Err(HandlerError::permanent(anyhow!("empty name"))),
                "busy" => Err(HandlerError::retryable(anyhow!("resolver busy"))),
                _ => Ok(()),
            }
        }
    }

    fn context() -> JobContext<()> {
        JobContext::new((), Config::for_queue("ipns-entry-queue"))
    }

    #[tokio::test]
    async fn dispatch_outcomes() {
        let registry = HandlerRegistry::new().register(QueueCategory::IpnsEntry, Publish);
        let handler = registry.get(QueueCategory::IpnsEntry).unwrap();
        let json = Some("application/json");

        let outcome = handler
            .dispatch(&context(), Serializer::Json, json, br#"{"name":"site"}"#)
            .await;
        assert!(matches!(outcome, Outcome::Completed));

        let outcome = handler
            .dispatch(&context(), Serializer::Json, json, br#"{"name":"busy"}"#)
            .await;
        assert!(matches!(outcome, Outcome::Failed(e) if e.is_retryable()));

        let outcome = handler
            .dispatch(&context(), Serializer::Json, json, br#"{"name":""}"#)
            .await;
        assert!(matches!(outcome, Outcome::Failed(HandlerError::Permanent(_))));

        let outcome = handler
            .dispatch(&context(), Serializer::Json, json, b"{\"nam")
            .await;
        assert!(matches!(
            outcome,
            Outcome::Undecodable(QueueError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn mismatched_encoding_is_undecodable() {
        let registry = HandlerRegistry::new().register(QueueCategory::IpnsEntry, Publish);
        let handler = registry.get(QueueCategory::IpnsEntry).unwrap();

        let outcome = handler
            .dispatch(
                &context(),
                Serializer::Json,
                Some("application/cbor"),
                br#"{"name":"site"}"#,
            )
            .await;
        assert!(matches!(outcome, Outcome::Undecodable(_)));
    }

    #[test]
    fn missing_handler_is_invalid_category() {
        let registry = HandlerRegistry::<()>::new();
        assert!(!registry.contains(QueueCategory::DatabaseFileAdd));
        assert!(matches!(
            registry.get(QueueCategory::DatabaseFileAdd),
            Err(QueueError::InvalidCategory(name)) if name == "dfa-queue"
        ));
    }
}
