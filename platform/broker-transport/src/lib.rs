//! # Broker Transport Abstraction
//!
//! A platform-level abstraction over a queue/topic message broker.
//!
//! ## Why This Lives in Tier 1
//!
//! The broker transport is a **shared runtime capability** that the
//! reliability layer (`event-relay`) and any future production binding
//! depend on. Placing it in `platform/` allows:
//! - The reliability layer to stay broker-agnostic
//! - Config-driven swap between a real broker binding (production) and
//!   `InMemoryBroker` (dev/test)
//!
//! ## Surface
//!
//! - [`BrokerTransport`]: open senders, pull-receive messages
//! - [`BrokerSender`]: size-bounded batch construction and send
//! - [`MessageLock`]: per-message settlement (complete / abandon /
//!   dead-letter / defer) and lock renewal
//! - [`InMemoryBroker`]: in-memory implementation for dev and tests
//!
//! ## Usage
//!
//! ```rust
//! use broker_transport::{BrokerTransport, InMemoryBroker, NativeMessage, ReceiveMode, ReceiveTarget};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//!
//! // Send a batch
//! let sender = broker.create_sender("billing.events").await?;
//! let mut batch = sender.create_batch();
//! assert!(batch.try_add(&NativeMessage::new("msg-1".to_string(), b"hello".to_vec())));
//! sender.send_batch(batch).await?;
//!
//! // Receive it back
//! let target = ReceiveTarget::queue("billing.events");
//! let deliveries = broker
//!     .receive(&target, 10, Duration::from_secs(1), ReceiveMode::PeekLock)
//!     .await?;
//! for delivery in deliveries {
//!     delivery.lock.complete().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod inmemory;
mod message;

pub use inmemory::InMemoryBroker;
pub use message::{MessageBatch, NativeMessage, ReceivedMessage};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Errors that can occur when talking to the broker
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to send batch: {0}")]
    SendError(String),

    #[error("failed to receive messages: {0}")]
    ReceiveError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("message of {size} bytes exceeds the maximum batch size of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message lock lost or expired: {0}")]
    LockLost(String),

    #[error("message already settled: {0}")]
    AlreadySettled(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Sub-queue selector for receive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueue {
    /// The main queue / subscription
    None,
    /// The broker-managed dead-letter sub-queue
    DeadLetter,
}

/// Receive mode for pull operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Messages stay locked until settled through their [`MessageLock`]
    PeekLock,
    /// Messages are removed from the broker on receive; no settlement
    ReceiveAndDelete,
}

/// Addresses one queue, or one subscription of a topic, optionally its
/// dead-letter sub-queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveTarget {
    /// Queue or topic name
    pub destination: String,
    /// Subscription name when the destination is a topic
    pub subscription: Option<String>,
    /// Main queue or dead-letter sub-queue
    pub sub_queue: SubQueue,
}

impl ReceiveTarget {
    /// Target a queue's main sub-queue
    pub fn queue(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            subscription: None,
            sub_queue: SubQueue::None,
        }
    }

    /// Target a topic subscription's main sub-queue
    pub fn subscription(destination: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            subscription: Some(subscription.into()),
            sub_queue: SubQueue::None,
        }
    }

    /// Switch this target to the dead-letter sub-queue
    pub fn dead_letter(mut self) -> Self {
        self.sub_queue = SubQueue::DeadLetter;
        self
    }

    /// Human-readable entity path for logging (e.g. `orders/billing/$deadletter`)
    pub fn entity_path(&self) -> String {
        let mut path = self.destination.clone();
        if let Some(sub) = &self.subscription {
            path.push('/');
            path.push_str(sub);
        }
        if self.sub_queue == SubQueue::DeadLetter {
            path.push_str("/$deadletter");
        }
        path
    }
}

impl fmt::Display for ReceiveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_path())
    }
}

/// One received message together with its settlement handle.
///
/// The lock is exclusively owned by the one in-flight invocation
/// processing the message; exactly one terminal action (complete,
/// abandon, dead-letter, defer) may be applied to it.
pub struct Delivery {
    pub message: ReceivedMessage,
    pub lock: Box<dyn MessageLock>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Settlement and renewal handle for one in-flight message.
///
/// Each terminal action is once-only by contract: applying a second
/// terminal action to the same lock is a caller error and yields
/// [`BrokerError::AlreadySettled`].
#[async_trait]
pub trait MessageLock: Send + Sync {
    /// Remove the message from the broker (successful processing)
    async fn complete(&self) -> BrokerResult<()>;

    /// Release the message back to the broker for immediate redelivery,
    /// attaching the given properties to the message
    async fn abandon(&self, properties_to_modify: BTreeMap<String, String>) -> BrokerResult<()>;

    /// Move the message to the dead-letter sub-queue with a short reason
    /// and a longer description
    async fn dead_letter(
        &self,
        properties_to_modify: BTreeMap<String, String>,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()>;

    /// Set the message aside; it is only retrievable by explicit
    /// sequence-number receive
    async fn defer(&self) -> BrokerResult<()>;

    /// Extend the lock so the broker does not redeliver mid-processing
    async fn renew_lock(&self) -> BrokerResult<()>;
}

/// Destination-scoped batch sender
#[async_trait]
pub trait BrokerSender: Send + Sync {
    /// Construct an empty batch honoring this sender's size limit
    fn create_batch(&self) -> MessageBatch;

    /// Send a batch; the batch is consumed whether or not the send
    /// succeeds (the broker may have partially processed it)
    async fn send_batch(&self, batch: MessageBatch) -> BrokerResult<()>;
}

/// Core broker abstraction: open senders, pull-receive messages.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a sender handle scoped to one destination (queue or topic)
    async fn create_sender(&self, destination: &str) -> BrokerResult<Box<dyn BrokerSender>>;

    /// Receive up to `max_count` messages from the target, waiting at
    /// most `max_wait` for the first one. An empty vec signals "no more
    /// messages available right now".
    ///
    /// In [`ReceiveMode::ReceiveAndDelete`] the returned locks are
    /// inert; settlement already happened on receive.
    async fn receive(
        &self,
        target: &ReceiveTarget,
        max_count: usize,
        max_wait: Duration,
        mode: ReceiveMode,
    ) -> BrokerResult<Vec<Delivery>>;
}

impl fmt::Debug for dyn BrokerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BrokerTransport")
    }
}
