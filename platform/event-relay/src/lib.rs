//! # Event Relay
//!
//! A reliability layer between application code and the broker
//! transport: at-least-once batched publishing with partial-failure
//! reporting on the way out, and a retry/backoff/dead-letter state
//! machine around a user-supplied handler on the way in.
//!
//! ## Outbound path
//!
//! [`EventEnvelope`] → [`MessageConverter`] → [`BatchedSender`] →
//! broker transport. Events are partitioned by destination, packed
//! into size-bounded batches and sent sequentially; a [`SendError`]
//! names exactly which events were never confirmed sent.
//!
//! ## Inbound path
//!
//! broker transport → received message → [`MessageConverter`] →
//! [`SubscriberInvoker`] → handler → broker settlement. The invoker
//! classifies failures by the [`HandlerError`] transient tag and
//! drives them to one of four outcomes: complete, retry (re-raised to
//! the host), abandon, dead-letter.
//!
//! ## Usage
//!
//! ```rust
//! use broker_transport::{BrokerTransport, InMemoryBroker};
//! use event_relay::{BatchedSender, EventEnvelope, MessageConverter, SenderConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker: Arc<dyn BrokerTransport> = Arc::new(InMemoryBroker::new());
//! let sender = BatchedSender::new(
//!     broker,
//!     Arc::new(MessageConverter::new()),
//!     SenderConfig::new("app.events"),
//! );
//!
//! let events = vec![
//!     EventEnvelope::new(json!({"order_id": "ord_1"}))
//!         .with_subject("orders.order")
//!         .with_action("created"),
//! ];
//! sender.send(&events).await?;
//! # Ok(())
//! # }
//! ```

mod converter;
mod envelope;
mod invoker;
mod purger;
mod sender;
mod subscription;

pub use converter::{BodyCodec, ConvertError, JsonBodyCodec, MessageConverter};
pub use envelope::EventEnvelope;
pub use invoker::{
    HandlerError, InvokeError, Outcome, SubscriberInvoker, SubscriberPolicy,
    ABANDON_REASON_PROPERTY, MAX_DELIVERY_COUNT_REASON, MAX_REASON_CHARS, UNHANDLED_CATEGORY,
};
pub use purger::Purger;
pub use sender::{BatchedSender, SendError, SenderConfig};
pub use subscription::run_subscriber;
