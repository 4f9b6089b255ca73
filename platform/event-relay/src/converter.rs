//! Mapping between [`EventEnvelope`] and the broker-native message shape.
//!
//! Envelope metadata travels in the native message's application
//! properties under reserved `ev-` keys; free-form attributes are
//! carried verbatim (and therefore must not use the reserved prefix).
//! The body goes through a pluggable [`BodyCodec`], JSON by default.

use broker_transport::{NativeMessage, ReceivedMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::envelope::EventEnvelope;

/// Reserved application-property prefix for envelope metadata
pub const RESERVED_PROPERTY_PREFIX: &str = "ev-";

const PROP_OCCURRED_AT: &str = "ev-occurred-at";
const PROP_SUBJECT: &str = "ev-subject";
const PROP_ACTION: &str = "ev-action";
const PROP_TYPE: &str = "ev-type";
const PROP_SOURCE: &str = "ev-source";
const PROP_TENANT_ID: &str = "ev-tenant-id";
const PROP_PARTITION_KEY: &str = "ev-partition-key";
const PROP_ETAG: &str = "ev-etag";
const PROP_KEY: &str = "ev-key";
const PROP_DESTINATION: &str = "ev-destination";

/// Errors that can occur converting between envelope and native message
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("failed to encode body: {0}")]
    BodyEncode(String),

    #[error("failed to decode body: {0}")]
    BodyDecode(String),

    #[error("message id is not a valid uuid: {0}")]
    InvalidMessageId(String),

    #[error("occurred-at timestamp is malformed: {0}")]
    InvalidTimestamp(String),

    #[error("attribute key uses the reserved `{RESERVED_PROPERTY_PREFIX}` prefix: {0}")]
    ReservedAttributeKey(String),
}

/// Pluggable body (de)serializer.
///
/// The reliability layer treats bodies as opaque; this trait is the
/// seam where a wire format is chosen.
pub trait BodyCodec: Send + Sync {
    fn encode(&self, body: &serde_json::Value) -> Result<Vec<u8>, ConvertError>;
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, ConvertError>;
}

/// Default JSON body codec. A `Null` body encodes to zero bytes and
/// zero bytes decode back to `Null`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBodyCodec;

impl BodyCodec for JsonBodyCodec {
    fn encode(&self, body: &serde_json::Value) -> Result<Vec<u8>, ConvertError> {
        if body.is_null() {
            return Ok(Vec::new());
        }
        serde_json::to_vec(body).map_err(|e| ConvertError::BodyEncode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, ConvertError> {
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| ConvertError::BodyDecode(e.to_string()))
    }
}

/// Maps envelopes to broker-native messages and back.
pub struct MessageConverter {
    codec: Arc<dyn BodyCodec>,
}

impl MessageConverter {
    /// Converter with the default JSON body codec
    pub fn new() -> Self {
        Self::with_codec(Arc::new(JsonBodyCodec))
    }

    /// Converter with a custom body codec
    pub fn with_codec(codec: Arc<dyn BodyCodec>) -> Self {
        Self { codec }
    }

    /// Convert an envelope into a broker-native message
    pub fn to_native(&self, envelope: &EventEnvelope) -> Result<NativeMessage, ConvertError> {
        if let Some(bad) = envelope
            .attributes
            .keys()
            .find(|k| k.starts_with(RESERVED_PROPERTY_PREFIX))
        {
            return Err(ConvertError::ReservedAttributeKey(bad.clone()));
        }

        let body = self.codec.encode(&envelope.body)?;
        let mut native = NativeMessage::new(envelope.id.to_string(), body)
            .with_correlation_id(envelope.correlation_id.clone())
            .with_partition_key(envelope.partition_key.clone())
            .with_property(PROP_OCCURRED_AT, envelope.occurred_at.to_rfc3339());

        let metadata = [
            (PROP_SUBJECT, &envelope.subject),
            (PROP_ACTION, &envelope.action),
            (PROP_TYPE, &envelope.event_type),
            (PROP_SOURCE, &envelope.source),
            (PROP_TENANT_ID, &envelope.tenant_id),
            // Also set natively above for broker-side routing; the
            // property is what survives the trip back, since received
            // messages do not expose the native partition key.
            (PROP_PARTITION_KEY, &envelope.partition_key),
            (PROP_ETAG, &envelope.etag),
            (PROP_KEY, &envelope.key),
            (PROP_DESTINATION, &envelope.destination),
        ];
        for (prop, value) in metadata {
            if let Some(value) = value {
                native = native.with_property(prop, value.clone());
            }
        }
        for (key, value) in &envelope.attributes {
            native = native.with_property(key.clone(), value.clone());
        }

        Ok(native)
    }

    /// Convert a received message back into an envelope, decoding the body
    pub fn from_native(&self, message: &ReceivedMessage) -> Result<EventEnvelope, ConvertError> {
        let id = Uuid::parse_str(&message.message_id)
            .map_err(|_| ConvertError::InvalidMessageId(message.message_id.clone()))?;

        let occurred_at = match message.application_properties.get(PROP_OCCURRED_AT) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|_| ConvertError::InvalidTimestamp(raw.clone()))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };

        let mut envelope = self.metadata_envelope(message, id, occurred_at);
        envelope.body = self.codec.decode(&message.body)?;
        Ok(envelope)
    }

    /// Build an envelope from message metadata only, leaving the body
    /// untouched (`Null`).
    ///
    /// Infallible and cheap: used to open a diagnostic scope before
    /// body decoding has had a chance to fail. Unparseable fields fall
    /// back to neutral values.
    pub fn metadata_only(&self, message: &ReceivedMessage) -> EventEnvelope {
        let id = Uuid::parse_str(&message.message_id).unwrap_or(Uuid::nil());
        let occurred_at = message
            .application_properties
            .get(PROP_OCCURRED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        self.metadata_envelope(message, id, occurred_at)
    }

    fn metadata_envelope(
        &self,
        message: &ReceivedMessage,
        id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> EventEnvelope {
        let prop = |key: &str| message.application_properties.get(key).cloned();

        let attributes = message
            .application_properties
            .iter()
            .filter(|(k, _)| !k.starts_with(RESERVED_PROPERTY_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        EventEnvelope {
            id,
            occurred_at,
            correlation_id: message.correlation_id.clone(),
            subject: prop(PROP_SUBJECT),
            action: prop(PROP_ACTION),
            event_type: prop(PROP_TYPE),
            source: prop(PROP_SOURCE),
            tenant_id: prop(PROP_TENANT_ID),
            partition_key: prop(PROP_PARTITION_KEY),
            etag: prop(PROP_ETAG),
            key: prop(PROP_KEY),
            destination: prop(PROP_DESTINATION),
            attributes,
            body: serde_json::Value::Null,
        }
    }
}

impl Default for MessageConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_envelope() -> EventEnvelope {
        EventEnvelope::new(json!({"amount": 100, "currency": "usd"}))
            .with_correlation_id("corr-1")
            .with_subject("payments.payment")
            .with_action("succeeded")
            .with_event_type("PaymentSucceededV1")
            .with_source("payments")
            .with_tenant_id("tenant-123")
            .with_partition_key("pk-tenant-123")
            .with_etag("etag-9")
            .with_key("pay_123")
            .with_destination("payments.events")
            .with_attribute("region", "eu-west")
    }

    fn receive(native: NativeMessage) -> ReceivedMessage {
        ReceivedMessage::from_native(native, 1)
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let converter = MessageConverter::new();
        let envelope = full_envelope();

        let native = converter.to_native(&envelope).unwrap();
        let back = converter.from_native(&receive(native)).unwrap();

        assert_eq!(back.id, envelope.id);
        assert_eq!(back.correlation_id, envelope.correlation_id);
        assert_eq!(back.subject, envelope.subject);
        assert_eq!(back.action, envelope.action);
        assert_eq!(back.event_type, envelope.event_type);
        assert_eq!(back.source, envelope.source);
        assert_eq!(back.tenant_id, envelope.tenant_id);
        assert_eq!(back.partition_key, envelope.partition_key);
        assert_eq!(back.etag, envelope.etag);
        assert_eq!(back.key, envelope.key);
        assert_eq!(back.destination, envelope.destination);
        assert_eq!(back.attributes, envelope.attributes);
        assert_eq!(back.body, envelope.body);
        assert_eq!(
            back.occurred_at.timestamp_millis(),
            envelope.occurred_at.timestamp_millis()
        );
    }

    #[test]
    fn test_partition_key_survives_round_trip() {
        let converter = MessageConverter::new();
        let envelope = EventEnvelope::new(json!({})).with_partition_key("tenant-123");

        let native = converter.to_native(&envelope).unwrap();
        // Set natively for broker-side routing and carried as a
        // reserved property for the way back
        assert_eq!(native.partition_key.as_deref(), Some("tenant-123"));
        assert_eq!(
            native.application_properties.get(PROP_PARTITION_KEY).map(String::as_str),
            Some("tenant-123")
        );

        let back = converter.from_native(&receive(native)).unwrap();
        assert_eq!(back.partition_key.as_deref(), Some("tenant-123"));
        // The reserved property does not leak into free-form attributes
        assert!(back.attributes.is_empty());
    }

    #[test]
    fn test_reserved_attribute_key_is_rejected() {
        let converter = MessageConverter::new();
        let envelope = EventEnvelope::new(json!({})).with_attribute("ev-sneaky", "x");

        let result = converter.to_native(&envelope);
        assert!(matches!(result, Err(ConvertError::ReservedAttributeKey(k)) if k == "ev-sneaky"));
    }

    #[test]
    fn test_metadata_only_leaves_body_null() {
        let converter = MessageConverter::new();
        let native = converter.to_native(&full_envelope()).unwrap();

        let meta = converter.metadata_only(&receive(native));
        assert!(meta.body.is_null());
        assert_eq!(meta.subject.as_deref(), Some("payments.payment"));
        assert_eq!(meta.tenant_id.as_deref(), Some("tenant-123"));
    }

    #[test]
    fn test_metadata_only_is_lenient_on_garbage() {
        let converter = MessageConverter::new();
        let message = ReceivedMessage::from_native(
            NativeMessage::new("not-a-uuid".to_string(), b"{ broken".to_vec()),
            1,
        );

        let meta = converter.metadata_only(&message);
        assert_eq!(meta.id, Uuid::nil());
        assert!(meta.body.is_null());
    }

    #[test]
    fn test_from_native_rejects_bad_message_id() {
        let converter = MessageConverter::new();
        let message =
            ReceivedMessage::from_native(NativeMessage::new("oops".to_string(), Vec::new()), 1);

        assert!(matches!(
            converter.from_native(&message),
            Err(ConvertError::InvalidMessageId(_))
        ));
    }

    #[test]
    fn test_from_native_rejects_broken_body() {
        let converter = MessageConverter::new();
        let envelope = EventEnvelope::new(json!({"ok": true}));
        let mut native = converter.to_native(&envelope).unwrap();
        native.body = b"{ not json".to_vec();

        assert!(matches!(
            converter.from_native(&receive(native)),
            Err(ConvertError::BodyDecode(_))
        ));
    }

    #[test]
    fn test_null_body_round_trips_as_empty_bytes() {
        let converter = MessageConverter::new();
        let envelope = EventEnvelope::new(serde_json::Value::Null);

        let native = converter.to_native(&envelope).unwrap();
        assert!(native.body.is_empty());

        let back = converter.from_native(&receive(native)).unwrap();
        assert!(back.body.is_null());
    }
}
