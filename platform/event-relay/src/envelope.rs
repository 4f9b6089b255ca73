//! # Event Envelope
//!
//! Application-level event envelope carried across the broker.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: one envelope struct for every event
//!    that crosses the publish/consume boundary
//! 2. **Immutability**: created by the application, never mutated once
//!    handed to the sender
//! 3. **Tracing**: built-in correlation id for linking related events
//!
//! The body is opaque to the reliability layer; it is encoded and
//! decoded by the pluggable [`crate::converter::BodyCodec`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::converter::ConvertError;

/// Standard event envelope for everything published through the
/// [`crate::BatchedSender`].
///
/// # Examples
///
/// ```rust
/// use event_relay::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(json!({
///     "payment_id": "pay_123",
///     "amount": 1000,
/// }))
/// .with_subject("payments.payment")
/// .with_action("succeeded")
/// .with_tenant_id("tenant-123")
/// .with_destination("payments.events");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier; must be unique within one send batch
    pub id: Uuid,

    /// ISO 8601 timestamp when the event was generated
    pub occurred_at: DateTime<Utc>,

    /// Links related events in a business transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// What the event is about (e.g. "payments.payment")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// What happened to the subject (e.g. "succeeded")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Payload type discriminator for consumers
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// System or module that produced the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Tenant identifier for multi-tenant isolation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Broker partition routing hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,

    /// Optimistic-concurrency tag of the entity the event describes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Business key of the entity the event describes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Logical queue/topic to send to; the sender-wide default applies
    /// when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// Ordered free-form metadata carried alongside the body
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// Opaque event payload
    #[serde(default)]
    pub body: serde_json::Value,
}

impl EventEnvelope {
    /// Create a new envelope with an auto-generated id and timestamp
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            correlation_id: None,
            subject: None,
            action: None,
            event_type: None,
            source: None,
            tenant_id: None,
            partition_key: None,
            etag: None,
            key: None,
            destination: None,
            attributes: BTreeMap::new(),
            body,
        }
    }

    /// Create an envelope with an explicit id (useful for testing)
    pub fn with_id(id: Uuid, body: serde_json::Value) -> Self {
        Self {
            id,
            ..Self::new(body)
        }
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the subject
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the action
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the payload type discriminator
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Set the producing system
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the tenant id
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the partition key
    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Set the entity etag
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Set the entity business key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the logical destination
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Add a free-form attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Deserialize the body into a concrete payload type
    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConvertError> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| ConvertError::BodyDecode(e.to_string()))
    }
}
