//! Routing consumed deliveries to category handlers.
//!
//! A [`Dispatcher`] serves one category. [`Dispatcher::consume`] binds the
//! category's queue (idempotently), opens a manual-ack consumer on the
//! manager's channel and spawns one task per delivery. Each task decodes the
//! payload, invokes the registered [`JobHandler`] and settles the delivery
//! according to the [`RedeliveryPolicy`]:
//!
//! | outcome                          | settlement                  |
//! |----------------------------------|-----------------------------|
//! | success                          | ack                         |
//! | retryable, within budget         | nack, requeue               |
//! | retryable, budget exhausted      | nack, no requeue            |
//! | permanent                        | nack, no requeue            |
//! | payload could not be decoded     | nack, no requeue            |
//!
//! A nack without requeue routes the message to the queue's dead-letter
//! queue when the dead-letter topology is enabled, and drops it otherwise.
//!
//! Concurrency is bounded by the manager's prefetch count: a delivery is only
//! pulled from the stream once a permit is available, and handler tasks are
//! tracked so cancellation can wait for them.
//!
//! # Lifecycle
//! ```text
//! Uninitialized -> TopologyReady -> Consuming -> Draining -> Closed
//!                                       \________________-> Closed (fatal error)
//! ```
//! Progress can be observed with [`Dispatcher::subscribe`].
use std::sync::Arc;

use anyhow::anyhow;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, info_span, instrument, warn, Instrument};

pub use self::handler::{HandlerError, HandlerRegistry, JobContext, JobHandler, Outcome};
use self::handler::ErasedHandler;
use crate::{
    acker::{Acker, Settlement},
    config::{Config, DEFAULT_MAX_REDELIVERIES},
    error::{QueueError, Result},
    manager::{QueueManager, Role},
    queue::{Channel, Connection, Delivery},
    serializer::Serializer,
    topology::QueueCategory,
};

mod handler;

/// Where a dispatcher is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Uninitialized,
    /// The queue is bound; the consumer is not yet registered.
    TopologyReady,
    /// Deliveries are being dispatched.
    Consuming,
    /// No new deliveries are accepted; in-flight handlers are finishing.
    Draining,
    Closed,
}

/// Decides how failed deliveries are settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Number of times a retryable failure is requeued. The delivery that
    /// fails on attempt `max_redeliveries + 1` is rejected.
    pub max_redeliveries: u32,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }
}

impl From<&Config> for RedeliveryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_redeliveries: config.max_redeliveries,
        }
    }
}

impl RedeliveryPolicy {
    pub fn settle(&self, outcome: &Outcome, attempt: u32) -> Settlement {
        match outcome {
            Outcome::Completed => Settlement::Ack,
            Outcome::Failed(HandlerError::Retryable(_)) if attempt <= self.max_redeliveries => {
                Settlement::Requeue
            }
            Outcome::Failed(_) | Outcome::Undecodable(_) => Settlement::Reject,
        }
    }
}

/// Consumes one category's queue and dispatches to its handler.
pub struct Dispatcher<S> {
    category: QueueCategory,
    handler: Arc<dyn ErasedHandler<S>>,
    context: JobContext<S>,
    policy: RedeliveryPolicy,
    state: watch::Sender<ConsumerState>,
}

impl<S: Send + Sync + 'static> Dispatcher<S> {
    /// Fails with [`QueueError::InvalidCategory`] if `registry` holds no
    /// handler for `category`.
    pub fn new(
        category: QueueCategory,
        registry: &HandlerRegistry<S>,
        context: JobContext<S>,
        policy: RedeliveryPolicy,
    ) -> Result<Self> {
        let handler = registry.get(category)?;
        let (state, _) = watch::channel(ConsumerState::Uninitialized);

        Ok(Self {
            category,
            handler,
            context,
            policy,
            state,
        })
    }

    pub fn category(&self) -> QueueCategory {
        self.category
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Consumes the manager's queue until `cancel` fires or the channel
    /// fails.
    ///
    /// On cancellation the broker-side consumer is cancelled, in-flight
    /// handlers run to completion and settle their deliveries, and `Ok(())`
    /// is returned. A failed stream, ack or nack is fatal: the loop stops,
    /// in-flight handlers are awaited and the error is returned. Unsettled
    /// deliveries are redelivered by the broker once the channel closes.
    #[instrument(skip_all, fields(queue = %manager.queue().name), level = "info")]
    pub async fn consume<C: Connection>(
        &self,
        manager: &QueueManager<C>,
        consumer_tag: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        if manager.category() != self.category {
            return Err(QueueError::Config(format!(
                "dispatcher for `{}` cannot consume `{}`",
                self.category,
                manager.category()
            )));
        }
        if manager.role() != Role::Consumer {
            return Err(QueueError::Config(format!(
                "manager for `{}` was initialized as a publisher",
                self.category
            )));
        }

        let result = self.run(manager, consumer_tag, cancel).await;
        self.set_state(ConsumerState::Closed);
        info!("consumer stopped");

        result
    }

    async fn run<C: Connection>(
        &self,
        manager: &QueueManager<C>,
        consumer_tag: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let channel = manager.channel().clone();
        let queue = manager.queue().name.clone();

        manager.topology().bind(&channel).await?;
        self.set_state(ConsumerState::TopologyReady);

        let mut deliveries = channel.consume(&queue, consumer_tag).await?;
        self.set_state(ConsumerState::Consuming);
        info!(consumer_tag, "consuming");

        let limit = match manager.prefetch() {
            0 => Semaphore::MAX_PERMITS,
            prefetch => usize::from(prefetch),
        };
        let permits = Arc::new(Semaphore::new(limit));
        let tracker = TaskTracker::new();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<QueueError>(1);
        let serializer = manager.serializer();

        let result = loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(err) = fatal_rx.recv() => break Err(err),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(err) = fatal_rx.recv() => break Err(err),
                delivery = deliveries.next() => delivery,
            };

            let delivery = match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!("consumer stream failed: {e}");
                    break Err(e);
                }
                None => {
                    error!(consumer_tag, "consumer cancelled by the broker");
                    break Err(QueueError::Channel(anyhow!(
                        "consumer `{consumer_tag}` was cancelled by the broker"
                    )));
                }
            };

            let span = info_span!(
                "job",
                queue = %queue,
                delivery_tag = delivery.delivery_tag,
                attempt = delivery.attempt
            );
            tracker.spawn(
                process(
                    self.handler.clone(),
                    self.context.clone(),
                    self.policy,
                    serializer,
                    delivery,
                    fatal_tx.clone(),
                    permit,
                )
                .instrument(span),
            );
        };

        if result.is_ok() {
            self.set_state(ConsumerState::Draining);
            info!(in_flight = tracker.len(), "draining");
            if let Err(e) = channel.cancel(consumer_tag).await {
                warn!("failed to cancel consumer: {e}");
            }
        }

        drop(deliveries);
        tracker.close();
        tracker.wait().await;

        // A settlement may have failed while draining.
        result.and_then(|()| match fatal_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        })
    }
}

/// Runs the handler for one delivery and settles it.
async fn process<S, A>(
    handler: Arc<dyn ErasedHandler<S>>,
    context: JobContext<S>,
    policy: RedeliveryPolicy,
    serializer: Serializer,
    delivery: Delivery<A>,
    fatal: mpsc::Sender<QueueError>,
    _permit: OwnedSemaphorePermit,
) where
    S: Send + Sync + 'static,
    A: Acker,
{
    let Delivery {
        data,
        attempt,
        content_type,
        acker,
        ..
    } = delivery;

    let outcome = handler
        .dispatch(&context, serializer, content_type.as_deref(), &data)
        .await;
    let settlement = policy.settle(&outcome, attempt);

    match (&outcome, settlement) {
        (Outcome::Completed, _) => info!("job completed"),
        (Outcome::Failed(e), Settlement::Requeue) => warn!("job failed, requeueing: {e}"),
        (Outcome::Failed(e @ HandlerError::Retryable(_)), _) => {
            error!("job failed after {attempt} attempts, rejecting: {e}")
        }
        (Outcome::Failed(e), _) => error!("job failed, rejecting: {e}"),
        (Outcome::Undecodable(e), _) => error!("rejecting undecodable message: {e}"),
    }

    if let Err(e) = settlement.apply(&acker).await {
        error!(?settlement, "failed to settle delivery: {e}");
        _ = fatal.try_send(e);
    }
}
