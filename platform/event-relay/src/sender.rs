//! Batched at-least-once event publishing.
//!
//! Events are partitioned by resolved destination, packed into
//! size-bounded broker batches, and sent one destination at a time.
//! Any unrecoverable failure reports exactly which events were never
//! confirmed sent so the caller can re-drive them.

use broker_transport::{BrokerError, BrokerTransport, NativeMessage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::converter::{ConvertError, MessageConverter};
use crate::envelope::EventEnvelope;

/// Destination configuration for a [`BatchedSender`].
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Destination used when an envelope does not name one
    pub default_destination: String,
    /// Per-destination transport-name overrides, keyed by logical name
    pub destination_overrides: HashMap<String, String>,
}

impl SenderConfig {
    pub fn new(default_destination: impl Into<String>) -> Self {
        Self {
            default_destination: default_destination.into(),
            destination_overrides: HashMap::new(),
        }
    }

    /// Map a logical destination to a different transport name
    pub fn with_override(
        mut self,
        logical: impl Into<String>,
        transport_name: impl Into<String>,
    ) -> Self {
        self.destination_overrides
            .insert(logical.into(), transport_name.into());
        self
    }

    /// Resolve an envelope's requested destination to the final
    /// transport name
    pub fn resolve(&self, requested: Option<&str>) -> String {
        let logical = requested.unwrap_or(&self.default_destination);
        self.destination_overrides
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }
}

/// Unrecoverable send failure carrying full unsent-event context.
///
/// `unsent` holds, in original input order, the ids of every event that
/// was never confirmed sent — the remainder of the failing destination
/// plus all events for destinations not yet attempted. The caller
/// decides whether to re-drive that subset.
#[derive(Debug, thiserror::Error)]
#[error("{message} ({} of {total} events unsent)", .unsent.len())]
pub struct SendError {
    /// Ids of events never confirmed sent, in input order
    pub unsent: Vec<Uuid>,
    /// Total number of events in the failed `send` call
    pub total: usize,
    /// What went wrong
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SendError {
    fn new(unsent: Vec<Uuid>, total: usize, message: impl Into<String>) -> Self {
        Self {
            unsent,
            total,
            message: message.into(),
            source: None,
        }
    }

    fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Publishes batches of envelopes with at-least-once semantics.
///
/// Destinations are processed strictly sequentially within one `send`
/// call, which keeps unsent-event accounting deterministic. Within a
/// destination, send order matches input order; across destinations no
/// ordering is guaranteed.
pub struct BatchedSender {
    transport: Arc<dyn BrokerTransport>,
    converter: Arc<MessageConverter>,
    config: SenderConfig,
}

impl BatchedSender {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        converter: Arc<MessageConverter>,
        config: SenderConfig,
    ) -> Self {
        Self {
            transport,
            converter,
            config,
        }
    }

    /// Send all events, batching per destination.
    ///
    /// An empty input returns immediately without touching the broker.
    /// Duplicate ids and conversion failures fail fast with every event
    /// reported unsent.
    pub async fn send(&self, events: &[EventEnvelope]) -> Result<(), SendError> {
        if events.is_empty() {
            return Ok(());
        }
        let total = events.len();

        let mut seen = HashSet::with_capacity(total);
        for event in events {
            if !seen.insert(event.id) {
                return Err(SendError::new(
                    events.iter().map(|e| e.id).collect(),
                    total,
                    format!("duplicate event id {} in send batch", event.id),
                ));
            }
        }

        // Convert everything up front so a converter failure costs no
        // broker traffic.
        let mut converted = Vec::with_capacity(total);
        for event in events {
            let native = self.converter.to_native(event).map_err(|e: ConvertError| {
                SendError::new(
                    events.iter().map(|ev| ev.id).collect(),
                    total,
                    format!("failed to convert event {}", event.id),
                )
                .with_source(e)
            })?;
            let destination = self.config.resolve(event.destination.as_deref());
            converted.push((event.id, destination, native));
        }

        // Partition into per-destination queues, preserving input order
        // within each destination and first-seen destination order.
        let mut order: Vec<String> = Vec::new();
        let mut queues: HashMap<String, VecDeque<(Uuid, NativeMessage)>> = HashMap::new();
        for (id, destination, native) in converted {
            if !queues.contains_key(&destination) {
                order.push(destination.clone());
            }
            queues
                .entry(destination)
                .or_default()
                .push_back((id, native));
        }

        for (dest_index, destination) in order.iter().enumerate() {
            let mut queue = queues
                .remove(destination)
                .unwrap_or_default();

            let unsent_from = |queue: &VecDeque<(Uuid, NativeMessage)>,
                               in_flight: &[Uuid]| {
                let mut unsent: Vec<Uuid> = in_flight.to_vec();
                unsent.extend(queue.iter().map(|(id, _)| *id));
                for later in &order[dest_index + 1..] {
                    if let Some(q) = queues.get(later) {
                        unsent.extend(q.iter().map(|(id, _)| *id));
                    }
                }
                unsent
            };

            let sender = match self.transport.create_sender(destination).await {
                Ok(sender) => sender,
                Err(e) => {
                    return Err(SendError::new(
                        unsent_from(&queue, &[]),
                        total,
                        format!("failed to open sender for destination `{destination}`"),
                    )
                    .with_source(e));
                }
            };

            while !queue.is_empty() {
                let mut batch = sender.create_batch();
                let mut batch_ids = Vec::new();

                // The head always goes in: a message too large for an
                // empty batch can never be sent.
                let Some((head_id, head)) = queue.pop_front() else {
                    break;
                };
                if !batch.try_add(&head) {
                    return Err(SendError::new(
                        unsent_from(&queue, &[head_id]),
                        total,
                        format!(
                            "event {head_id} does not fit an empty batch for destination `{destination}`"
                        ),
                    )
                    .with_source(BrokerError::MessageTooLarge {
                        size: head.encoded_size(),
                        max: batch.max_bytes(),
                    }));
                }
                batch_ids.push(head_id);

                // Greedily fill the rest of the batch.
                while let Some((id, native)) = queue.front() {
                    if batch.try_add(native) {
                        batch_ids.push(*id);
                        queue.pop_front();
                    } else {
                        break;
                    }
                }

                let batch_len = batch.len();
                if let Err(e) = sender.send_batch(batch).await {
                    let unsent = unsent_from(&queue, &batch_ids);
                    tracing::error!(
                        destination = %destination,
                        unsent = unsent.len(),
                        total = total,
                        error = %e,
                        "Batch send failed; remaining events reported unsent"
                    );
                    return Err(SendError::new(
                        unsent,
                        total,
                        format!("transport send failed for destination `{destination}`"),
                    )
                    .with_source(e));
                }

                tracing::debug!(
                    destination = %destination,
                    batch_len = batch_len,
                    remaining = queue.len(),
                    "Sent batch"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults_to_sender_wide_destination() {
        let config = SenderConfig::new("events.default");
        assert_eq!(config.resolve(None), "events.default");
        assert_eq!(config.resolve(Some("orders.events")), "orders.events");
    }

    #[test]
    fn test_resolve_applies_override() {
        let config =
            SenderConfig::new("events.default").with_override("orders.events", "orders-prod");
        assert_eq!(config.resolve(Some("orders.events")), "orders-prod");
        // The default destination is itself subject to overrides
        let config = SenderConfig::new("events.default").with_override("events.default", "bulk");
        assert_eq!(config.resolve(None), "bulk");
    }

    #[test]
    fn test_send_error_display_counts() {
        let err = SendError::new(vec![Uuid::new_v4(), Uuid::new_v4()], 5, "boom");
        assert_eq!(err.to_string(), "boom (2 of 5 events unsent)");
    }
}
