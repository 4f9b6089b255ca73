//! Broker-native message types and the size-bounded batch

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Fixed per-message framing allowance used when estimating encoded size.
const MESSAGE_OVERHEAD_BYTES: usize = 64;

/// An outbound broker-native message.
///
/// This is what the reliability layer hands to a [`crate::BrokerSender`]
/// after converting an application-level envelope. All metadata beyond
/// the broker's first-class fields travels in `application_properties`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeMessage {
    /// Application-assigned message identifier (idempotency key)
    pub message_id: String,

    /// Links related messages in a business transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Broker partition routing hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,

    /// Session for session-aware entities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Key/value metadata carried alongside the body
    pub application_properties: BTreeMap<String, String>,

    /// Opaque payload bytes
    pub body: Vec<u8>,
}

impl NativeMessage {
    /// Create a new native message with the given id and body
    pub fn new(message_id: String, body: Vec<u8>) -> Self {
        Self {
            message_id,
            correlation_id: None,
            partition_key: None,
            session_id: None,
            application_properties: BTreeMap::new(),
            body,
        }
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the partition key
    pub fn with_partition_key(mut self, partition_key: Option<String>) -> Self {
        self.partition_key = partition_key;
        self
    }

    /// Set an application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Estimated wire size used for batch admission
    pub fn encoded_size(&self) -> usize {
        let props: usize = self
            .application_properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        MESSAGE_OVERHEAD_BYTES
            + self.message_id.len()
            + self.correlation_id.as_deref().map_or(0, str::len)
            + self.partition_key.as_deref().map_or(0, str::len)
            + self.session_id.as_deref().map_or(0, str::len)
            + props
            + self.body.len()
    }
}

/// An inbound message as handed out by the broker.
///
/// Created by the transport on receive; the `delivery_count` reflects
/// how many times the broker has handed this message to a receiver,
/// including the current attempt. Settlement goes through the
/// [`crate::MessageLock`] paired with the message in a
/// [`crate::Delivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Broker-assigned (or application-assigned) message identifier
    pub message_id: String,

    /// Correlation id, if the publisher set one
    pub correlation_id: Option<String>,

    /// Session for session-aware entities
    pub session_id: Option<String>,

    /// Delivery attempt count, >= 1 for any received message
    pub delivery_count: u32,

    /// Key/value metadata carried alongside the body
    pub application_properties: BTreeMap<String, String>,

    /// Opaque payload bytes
    pub body: Vec<u8>,
}

impl ReceivedMessage {
    /// Build a received message from an outbound one, as a broker would
    /// on delivery. Mostly useful for transports and tests.
    pub fn from_native(native: NativeMessage, delivery_count: u32) -> Self {
        Self {
            message_id: native.message_id,
            correlation_id: native.correlation_id,
            session_id: native.session_id,
            delivery_count,
            application_properties: native.application_properties,
            body: native.body,
        }
    }
}

/// A size-bounded batch of native messages bound for one destination.
///
/// Admission is greedy: [`MessageBatch::try_add`] accepts a message only
/// while the estimated encoded size stays within the limit. A message
/// that does not fit an *empty* batch can never be sent.
#[derive(Debug)]
pub struct MessageBatch {
    max_bytes: usize,
    bytes: usize,
    messages: Vec<NativeMessage>,
}

impl MessageBatch {
    /// Construct an empty batch with the given byte limit
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            bytes: 0,
            messages: Vec::new(),
        }
    }

    /// Try to add a message; returns false (leaving the batch unchanged)
    /// when the message would push the batch past its size limit
    pub fn try_add(&mut self, message: &NativeMessage) -> bool {
        let size = message.encoded_size();
        if self.bytes + size > self.max_bytes {
            return false;
        }
        self.bytes += size;
        self.messages.push(message.clone());
        true
    }

    /// Number of messages currently in the batch
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when no message has been added yet
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Current estimated size in bytes
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// The batch's size limit in bytes
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Consume the batch, yielding its messages in insertion order
    pub fn into_messages(self) -> Vec<NativeMessage> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, body_len: usize) -> NativeMessage {
        NativeMessage::new(id.to_string(), vec![0u8; body_len])
    }

    #[test]
    fn test_encoded_size_grows_with_properties() {
        let bare = message("m1", 10);
        let with_props = bare.clone().with_property("tenant_id", "tenant-123");
        assert!(with_props.encoded_size() > bare.encoded_size());
    }

    #[test]
    fn test_batch_rejects_when_full() {
        let msg = message("m1", 100);
        let mut batch = MessageBatch::new(msg.encoded_size() + 10);

        assert!(batch.try_add(&msg));
        // Second copy does not fit anymore
        assert!(!batch.try_add(&msg));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_batch_rejects_oversized_message_even_when_empty() {
        let msg = message("m1", 1000);
        let mut batch = MessageBatch::new(64);

        assert!(!batch.try_add(&msg));
        assert!(batch.is_empty());
    }

    #[test]
    fn test_batch_preserves_insertion_order() {
        let mut batch = MessageBatch::new(64 * 1024);
        for i in 0..5 {
            assert!(batch.try_add(&message(&format!("m{i}"), 10)));
        }

        let ids: Vec<String> = batch
            .into_messages()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_received_from_native_carries_fields() {
        let native = message("m1", 4)
            .with_correlation_id(Some("corr-1".to_string()))
            .with_property("subject", "order");

        let received = ReceivedMessage::from_native(native, 3);
        assert_eq!(received.message_id, "m1");
        assert_eq!(received.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(received.delivery_count, 3);
        assert_eq!(
            received.application_properties.get("subject").map(String::as_str),
            Some("order")
        );
    }
}
