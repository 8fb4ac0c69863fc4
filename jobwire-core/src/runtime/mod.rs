//! A default worker loop for consumer processes.
//!
//! Worker binaries generally won't vary: parse configuration, connect,
//! consume one category until asked to stop, close. [`worker_loop`] does
//! exactly that, so a worker's `main` only has to build its
//! [`HandlerRegistry`] and store.
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::{
    config::Config,
    dispatcher::{Dispatcher, HandlerRegistry, JobContext, RedeliveryPolicy},
    logging,
    manager::{QueueManager, Role},
    queue::Connection,
};

/// Runs a consumer for `config.queue` until Ctrl-C.
///
/// # Example
/// ```no_run
/// use anyhow::Result;
/// use clap::Parser;
/// use jobwire::{
///     async_trait,
///     config::Config,
///     dispatcher::{HandlerError, HandlerRegistry, JobContext, JobHandler},
///     runtime::worker_loop,
///     topology::QueueCategory,
/// };
///
/// struct Pin;
///
/// #[async_trait]
/// impl JobHandler<()> for Pin {
///     type Payload = String;
///
///     async fn handle(&self, _ctx: &JobContext<()>, cid: String) -> Result<(), HandlerError> {
///         // ... pin `cid`
///         Ok(())
///     }
/// }
///
/// #[derive(Parser, Debug)]
/// pub struct Cli {
///     #[command(flatten)]
///     pub options: Config,
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let args = Cli::parse();
///     let registry = HandlerRegistry::new().register(QueueCategory::IpfsPin, Pin);
///     worker_loop(args.options, registry, ()).await
/// }
/// ```
#[instrument(skip_all, fields(queue = %config.queue))]
pub async fn worker_loop<S: Send + Sync + 'static>(
    config: Config,
    registry: HandlerRegistry<S>,
    store: S,
) -> Result<()> {
    logging::init(&config)?;
    config.validate()?;

    let category = config.category()?;
    let consumer_tag = config.consumer_tag();
    let policy = RedeliveryPolicy::from(&config);
    let manager = QueueManager::connect(&config, Role::Consumer).await?;
    let dispatcher = Dispatcher::new(category, &registry, JobContext::new(store, config), policy);
    let dispatcher = match dispatcher {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            manager.close().await.log();
            return Err(e.into());
        }
    };

    let cancel = CancellationToken::new();
    let signal = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        }
    });

    let result = serve(manager, &dispatcher, &consumer_tag, cancel).await;
    signal.abort();

    Ok(result?)
}

/// Consumes until `cancel` fires or the channel fails, then closes the
/// manager and logs the close report.
///
/// The consume error, if any, takes precedence over close errors.
pub async fn serve<C: Connection, S: Send + Sync + 'static>(
    manager: QueueManager<C>,
    dispatcher: &Dispatcher<S>,
    consumer_tag: &str,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let consumed = dispatcher.consume(&manager, consumer_tag, cancel).await;

    let report = manager.close().await;
    report.log();

    consumed.and(report.into_result())
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        dispatcher::{ConsumerState, HandlerError, JobHandler},
        error::QueueError,
        manager::ManagerOptions,
        queue::in_memory::InMemoryBroker,
        topology::QueueCategory,
    };

    struct Noop;

    #[async_trait]
    impl JobHandler<()> for Noop {
        type Payload = serde_json::Value;

        async fn handle(
            &self,
            _ctx: &JobContext<()>,
            _payload: serde_json::Value,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn dispatcher(category: QueueCategory) -> Dispatcher<()> {
        let registry = HandlerRegistry::new().register(category, Noop);
        let context = JobContext::new((), Config::for_queue(category.as_str()));
        Dispatcher::new(category, &registry, context, RedeliveryPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn serve_closes_manager_after_cancellation() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let options = ManagerOptions::new(QueueCategory::EmailSend, Role::Consumer);
        let manager = QueueManager::initialize(connection.clone(), options)
            .await
            .unwrap();
        let dispatcher = dispatcher(QueueCategory::EmailSend);

        let cancel = CancellationToken::new();
        cancel.cancel();
        serve(manager, &dispatcher, "test", cancel).await.unwrap();

        assert_eq!(dispatcher.state(), ConsumerState::Closed);
        assert!(connection.open_channel(1).await.is_err());
    }

    #[tokio::test]
    async fn serve_reports_consume_error_first() {
        let broker = InMemoryBroker::new();
        let options = ManagerOptions::new(QueueCategory::EmailSend, Role::Consumer);
        let manager = QueueManager::initialize(broker.connect().await.unwrap(), options)
            .await
            .unwrap();
        let dispatcher = dispatcher(QueueCategory::DatabaseFileAdd);

        let err = serve(manager, &dispatcher, "test", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }
}
