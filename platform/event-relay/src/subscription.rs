//! Receive-loop adapter bridging the broker to the invoker.
//!
//! This is the in-crate "hosting runtime": it pulls messages in
//! peek-lock mode and hands each one to the [`SubscriberInvoker`]
//! sequentially. Rethrown transient failures are logged and left
//! unsettled so the broker's own redelivery takes over; the loop keeps
//! running. The [`SubscriberInvoker`] stays usable standalone for hosts
//! that manage their own receive loop.

use broker_transport::{BrokerTransport, ReceiveMode, ReceiveTarget};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::envelope::EventEnvelope;
use crate::invoker::{HandlerError, InvokeError, SubscriberInvoker};

const RECEIVE_BATCH: usize = 10;
const RECEIVE_WAIT: Duration = Duration::from_secs(1);
// Applied after an empty receive; transports that return immediately
// instead of honoring max_wait would otherwise spin the loop hot.
const IDLE_BACKOFF: Duration = Duration::from_millis(50);
// Applied after a failed receive so a broken transport does not get
// hammered in a hot loop.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Run a subscriber loop until the cancellation token fires.
///
/// # Example
/// ```rust,no_run
/// use broker_transport::{BrokerTransport, InMemoryBroker, ReceiveTarget};
/// use event_relay::{run_subscriber, HandlerError, MessageConverter, SubscriberInvoker, SubscriberPolicy};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let broker: Arc<dyn BrokerTransport> = Arc::new(InMemoryBroker::new());
/// let converter = Arc::new(MessageConverter::new());
/// let invoker = Arc::new(SubscriberInvoker::new(converter, SubscriberPolicy::default()));
/// let cancel = CancellationToken::new();
///
/// tokio::spawn(run_subscriber(
///     broker,
///     ReceiveTarget::queue("orders.events"),
///     invoker,
///     |envelope| async move {
///         tracing::info!(subject = ?envelope.subject, "handling event");
///         Ok::<(), HandlerError>(())
///     },
///     cancel.clone(),
/// ));
/// # }
/// ```
pub async fn run_subscriber<H, Fut>(
    transport: Arc<dyn BrokerTransport>,
    target: ReceiveTarget,
    invoker: Arc<SubscriberInvoker>,
    handler: H,
    cancel: CancellationToken,
) where
    H: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    tracing::info!(target = %target, "Starting subscriber");

    loop {
        let deliveries = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.receive(&target, RECEIVE_BATCH, RECEIVE_WAIT, ReceiveMode::PeekLock) => {
                match received {
                    Ok(deliveries) => deliveries,
                    Err(e) => {
                        tracing::error!(target = %target, error = %e, "Receive failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
                        }
                    }
                }
            }
        };

        if deliveries.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(IDLE_BACKOFF) => continue,
            }
        }

        for delivery in deliveries {
            match invoker
                .invoke(&delivery.message, delivery.lock.as_ref(), &handler, &cancel)
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(
                        message_id = %delivery.message.message_id,
                        outcome = %outcome,
                        "Invocation finished"
                    );
                }
                Err(InvokeError::Cancelled) => {
                    tracing::info!(target = %target, "Subscriber cancelled mid-invocation");
                    return;
                }
                Err(InvokeError::Handler(e)) => {
                    // Left unsettled on purpose; the broker redelivers.
                    tracing::warn!(
                        message_id = %delivery.message.message_id,
                        error = %e,
                        "Handler failure re-raised; awaiting broker redelivery"
                    );
                }
                Err(InvokeError::Broker(e)) => {
                    tracing::error!(
                        message_id = %delivery.message.message_id,
                        error = %e,
                        "Settlement failed"
                    );
                }
            }
        }
    }

    tracing::info!(target = %target, "Subscriber stopped");
}
