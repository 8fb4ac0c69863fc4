#![cfg_attr(docsrs, feature(doc_cfg))]

//! Typed job dispatch over AMQP.
//!
//! jobwire turns a broker connection into a job system: producers publish
//! structured payloads to durable work queues or fan-out exchanges, and a
//! long-lived worker process consumes one job category, routing every
//! delivery to the handler registered for it and settling the delivery
//! according to the handler's result.
//!
//! # Building blocks
//!
//! - [`topology`]: the closed set of [`QueueCategory`](topology::QueueCategory)s
//!   and [`Exchange`](topology::Exchange)s, and how each is declared.
//! - [`manager`]: a [`QueueManager`](manager::QueueManager) owns one
//!   connection and one channel and declares a category's topology.
//! - [`publisher`]: publishing to the manager's queue or to a named exchange.
//! - [`dispatcher`]: consuming a queue and dispatching to
//!   [`JobHandler`](dispatcher::JobHandler)s with bounded concurrency, bounded
//!   redelivery and dead-lettering.
//! - [`queue`]: the broker abstraction, with an AMQP implementation and an
//!   in-memory emulation for tests.
//! - [`runtime`]: a ready-made worker loop.
//!
//! # Delivery guarantees
//!
//! Messages are persistent and queues durable. Deliveries are acknowledged
//! manually, only after their handler returns, so a worker that dies
//! mid-job has the job redelivered to another worker. Handlers must
//! therefore be idempotent: a job may run more than once, but a successfully
//! acknowledged job is never delivered again.
//!
//! # Example
//!
//! ```
//! use jobwire::{
//!     async_trait,
//!     config::Config,
//!     dispatcher::{
//!         Dispatcher, HandlerError, HandlerRegistry, JobContext, JobHandler, RedeliveryPolicy,
//!     },
//!     manager::{ManagerOptions, QueueManager, Role},
//!     queue::in_memory::InMemoryBroker,
//!     topology::QueueCategory,
//!     CancellationToken,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct KeyRequest {
//!     name: String,
//! }
//!
//! struct CreateKey;
//!
//! #[async_trait]
//! impl JobHandler<()> for CreateKey {
//!     type Payload = KeyRequest;
//!
//!     async fn handle(
//!         &self,
//!         _ctx: &JobContext<()>,
//!         request: KeyRequest,
//!     ) -> Result<(), HandlerError> {
//!         println!("creating key {}", request.name);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = InMemoryBroker::new();
//!
//!     // Every node declares its own queue on the `ipfs-key` exchange.
//!     let options =
//!         ManagerOptions::new(QueueCategory::IpfsKeyCreation, Role::Consumer).host_id("node-1");
//!     let worker = QueueManager::initialize(broker.connect().await?, options).await?;
//!
//!     let options =
//!         ManagerOptions::new(QueueCategory::IpfsKeyCreation, Role::Publisher).host_id("api");
//!     let api = QueueManager::initialize(broker.connect().await?, options).await?;
//!     api.publish_to_exchange(&KeyRequest { name: "site".into() }, "ipfs-key").await?;
//!
//!     let registry = HandlerRegistry::new().register(QueueCategory::IpfsKeyCreation, CreateKey);
//!     let context = JobContext::new((), Config::for_queue("ipfs-key-creation-queue"));
//!     let dispatcher = Dispatcher::new(
//!         QueueCategory::IpfsKeyCreation,
//!         &registry,
//!         context,
//!         RedeliveryPolicy::default(),
//!     )?;
//!
//!     let cancel = CancellationToken::new();
//!     tokio::spawn({
//!         let cancel = cancel.clone();
//!         async move {
//!             tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!             cancel.cancel();
//!         }
//!     });
//!     dispatcher.consume(&worker, "node-1", cancel).await?;
//!
//!     worker.close().await.into_result()?;
//!     api.close().await.into_result()?;
//!     Ok(())
//! }
//! ```
pub mod acker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod manager;
pub mod publisher;
pub mod queue;
pub mod runtime;
pub mod serializer;
pub mod topology;

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
pub use tracing;
