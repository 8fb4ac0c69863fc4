//! Provides a trait for settling deliveries in an asynchronous context.
//!
//! Every delivery handed out by a consumer must be explicitly settled, either
//! acknowledged (it is removed from the queue for good) or negatively
//! acknowledged (it is requeued for another attempt, or rejected outright).
//! Until then the broker considers the message in flight and will redeliver it
//! if this process dies.
//!
//! # Examples
//!
//! Implementing the `Acker` trait for a custom type:
//!
//! ```
//! use jobwire::{acker::Acker, error::Result};
//! use async_trait::async_trait;
//!
//! struct MyAcker;
//!
//! #[async_trait]
//! impl Acker for MyAcker {
//!     async fn ack(&self) -> Result<()> {
//!         // Custom acknowledgement logic here...
//!         Ok(())
//!     }
//!
//!     async fn nack(&self, requeue: bool) -> Result<()> {
//!         // Custom negative acknowledgement logic here...
//!         Ok(())
//!     }
//! }
//! ```
use async_trait::async_trait;

use crate::error::Result;

/// Represents a generic behavior for settling a single delivery.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    /// Acknowledge the delivery, removing it from the queue.
    async fn ack(&self) -> Result<()>;

    /// Negatively acknowledge the delivery. With `requeue` the broker hands it
    /// out again; without, it is discarded or dead-lettered.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// The final disposition of a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; remove it.
    Ack,
    /// Failed transiently; hand it out again.
    Requeue,
    /// Unprocessable; discard or dead-letter it.
    Reject,
}

impl Settlement {
    /// Apply this settlement through the given acker.
    pub async fn apply<A: Acker + ?Sized>(self, acker: &A) -> Result<()> {
        match self {
            Self::Ack => acker.ack().await,
            Self::Requeue => acker.nack(true).await,
            Self::Reject => acker.nack(false).await,
        }
    }
}
