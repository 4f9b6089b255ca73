//! Queue/subscription draining.

use broker_transport::{BrokerError, BrokerTransport, ReceiveMode, ReceiveTarget, ReceivedMessage};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

/// Drains a queue or topic subscription, optionally its dead-letter
/// sub-queue, by receive-and-delete looping until the broker reports
/// no more messages.
pub struct Purger {
    transport: Arc<dyn BrokerTransport>,
    batch_size: usize,
    max_wait: Duration,
}

impl Purger {
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            transport,
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    /// Receive batch size per loop iteration
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Bounded wait per receive call
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Drain the target until a receive returns zero messages,
    /// invoking `on_message` per drained message in receive order.
    /// Returns the number of messages purged.
    ///
    /// A transport error aborts the loop and is rethrown after being
    /// logged with the sub-queue context; nothing is retried here.
    pub async fn purge(
        &self,
        destination: &str,
        subscription: Option<&str>,
        dead_letter: bool,
        mut on_message: Option<&mut dyn FnMut(&ReceivedMessage)>,
    ) -> Result<u64, BrokerError> {
        let mut target = match subscription {
            Some(sub) => ReceiveTarget::subscription(destination, sub),
            None => ReceiveTarget::queue(destination),
        };
        if dead_letter {
            target = target.dead_letter();
        }

        let mut purged: u64 = 0;
        loop {
            let deliveries = self
                .transport
                .receive(
                    &target,
                    self.batch_size,
                    self.max_wait,
                    ReceiveMode::ReceiveAndDelete,
                )
                .await
                .map_err(|e| {
                    tracing::error!(target = %target, error = %e, "Purge receive failed");
                    e
                })?;

            if deliveries.is_empty() {
                break;
            }

            purged += deliveries.len() as u64;
            if let Some(callback) = on_message.as_mut() {
                for delivery in &deliveries {
                    callback(&delivery.message);
                }
            }
        }

        tracing::info!(target = %target, purged = purged, "Purge finished");
        Ok(purged)
    }
}
