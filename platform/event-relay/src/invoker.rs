//! Per-message subscriber invocation pipeline.
//!
//! One invocation walks a received message through
//! `Received -> Processing -> {Completed, Retrying, Abandoned, DeadLettered}`.
//! The pipeline is composed of two layers with single responsibilities,
//! fixed at construction time: the correlation-scope layer (a tracing
//! span opened around everything, released on every exit path) and the
//! policy layer (classify the handler outcome, then retry, abandon,
//! dead-letter or rethrow per the configured [`SubscriberPolicy`]).
//!
//! `Retrying` is not durable: it ends either in `Abandoned` (message
//! released back to the broker immediately) or in the handler error
//! being returned to the hosting runtime so its own redelivery/backoff
//! takes over. This two-tier retry design is deliberate; do not
//! collapse it into one tier.

use broker_transport::{MessageLock, ReceivedMessage};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::converter::MessageConverter;
use crate::envelope::EventEnvelope;

/// Broker metadata values are size-limited; reasons attached to
/// abandon/dead-letter are truncated to this many characters. Full
/// detail goes to the log instead.
pub const MAX_REASON_CHARS: usize = 4096;

/// Dead-letter reason used when a tagged error carries no category
pub const UNHANDLED_CATEGORY: &str = "unhandled";

/// Dead-letter reason used when the delivery-count ceiling is hit
pub const MAX_DELIVERY_COUNT_REASON: &str = "max delivery count exceeded";

/// Property attached on abandon carrying the (truncated) failure reason
pub const ABANDON_REASON_PROPERTY: &str = "abandon-reason";

/// Per-subscriber retry/dead-letter configuration.
///
/// Immutable for the lifetime of one subscriber; safe for concurrent
/// reads across simultaneous invocations.
#[derive(Debug, Clone, Default)]
pub struct SubscriberPolicy {
    /// Release transient failures back to the broker instead of
    /// rethrowing them to the hosting runtime
    pub abandon_on_transient: bool,
    /// Dead-letter transient failures once the delivery count reaches
    /// this ceiling
    pub max_delivery_count: Option<u32>,
    /// Base in-process delay before settling a transient failure,
    /// multiplied by the delivery count
    pub retry_delay: Option<Duration>,
    /// Upper bound for the computed delay; acts as a fixed delay when
    /// `retry_delay` is unset
    pub max_retry_delay: Option<Duration>,
}

impl SubscriberPolicy {
    /// Delay applied before settling a transient failure on the given
    /// delivery attempt
    pub fn retry_backoff(&self, delivery_count: u32) -> Duration {
        // Saturating: `Duration * u32` panics on overflow.
        let scaled = |delay: Duration| delay.checked_mul(delivery_count).unwrap_or(Duration::MAX);
        match (self.retry_delay, self.max_retry_delay) {
            (Some(delay), Some(max)) => std::cmp::min(scaled(delay), max),
            (Some(delay), None) => scaled(delay),
            (None, Some(max)) => max,
            (None, None) => Duration::ZERO,
        }
    }
}

/// Terminal (or transitional, for `Retrying`) result of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded; the message was completed
    Completed,
    /// Transient failure about to be re-raised or released; carries the
    /// in-process delay that was applied
    Retrying { delay: Duration },
    /// Message released back to the broker with the failure reason
    Abandoned { reason: String },
    /// Message moved to the dead-letter sub-queue
    DeadLettered { reason: String },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Retrying { delay } => write!(f, "retrying after {}ms", delay.as_millis()),
            Outcome::Abandoned { reason } => write!(f, "abandoned: {reason}"),
            Outcome::DeadLettered { reason } => write!(f, "dead-lettered: {reason}"),
        }
    }
}

/// Tagged business-layer error.
///
/// The business layer declares whether a failure is transient (likely
/// to succeed on retry) and under which category it should be
/// dead-lettered, instead of the invoker inspecting error types.
/// Wrappers form a chain: classification uses the innermost tagged
/// error, while the *outer* message is what gets logged and attached to
/// the broker — detail already logged deeper in the call chain is not
/// duplicated.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    transient: bool,
    category: Option<String>,
    #[source]
    inner: Option<Box<HandlerError>>,
}

impl HandlerError {
    /// A failure likely to succeed on retry (timeout, throttling, ...)
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            category: None,
            inner: None,
        }
    }

    /// A permanent business/validation failure; always dead-lettered
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            category: None,
            inner: None,
        }
    }

    /// Declare the dead-letter category for this error
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Wrap a more specific error with outer context. The wrapper's
    /// text wins for logging; the wrapped error's tag wins for
    /// classification.
    pub fn wrap(message: impl Into<String>, inner: HandlerError) -> Self {
        Self {
            message: message.into(),
            transient: inner.transient,
            category: None,
            inner: Some(Box::new(inner)),
        }
    }

    /// Outer message text (what gets logged and attached to the broker)
    pub fn message(&self) -> &str {
        &self.message
    }

    fn root(&self) -> &HandlerError {
        let mut current = self;
        while let Some(inner) = &current.inner {
            current = inner;
        }
        current
    }

    /// Transient flag of the innermost tagged error
    pub fn is_transient(&self) -> bool {
        self.root().transient
    }

    /// Category of the innermost tagged error
    pub fn category(&self) -> Option<&str> {
        self.root().category.as_deref()
    }
}

/// Errors surfaced to the caller of [`SubscriberInvoker::invoke`].
///
/// Handled outcomes (complete, abandon, dead-letter) are *not* errors;
/// they come back as `Ok(Outcome)`.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// Transient failure deliberately re-raised so the hosting
    /// runtime's own redelivery/backoff takes over
    #[error("handler failed; message released for host-level redelivery: {0}")]
    Handler(#[from] HandlerError),

    /// The cancellation token fired; nothing was settled
    #[error("invocation cancelled")]
    Cancelled,

    /// A settlement or lock-renewal call failed
    #[error(transparent)]
    Broker(#[from] broker_transport::BrokerError),
}

/// Orchestrates one received message's lifecycle.
///
/// Explicitly constructed and owned by the subscriber (no global
/// state); holds nothing mutable between invocations beyond the
/// read-only policy, so one instance may serve concurrent invocations.
pub struct SubscriberInvoker {
    converter: Arc<MessageConverter>,
    policy: SubscriberPolicy,
}

impl SubscriberInvoker {
    pub fn new(converter: Arc<MessageConverter>, policy: SubscriberPolicy) -> Self {
        Self { converter, policy }
    }

    pub fn policy(&self) -> &SubscriberPolicy {
        &self.policy
    }

    /// Invoke `handler` for one received message and apply the
    /// retry/abandon/dead-letter policy to its outcome.
    ///
    /// The message's lock handle must be exclusively owned by this
    /// invocation; exactly one terminal action is applied to it.
    /// Cancellation during the retry delay propagates as
    /// [`InvokeError::Cancelled`] without settling the message.
    pub async fn invoke<H, Fut>(
        &self,
        message: &ReceivedMessage,
        lock: &dyn MessageLock,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<Outcome, InvokeError>
    where
        H: FnOnce(EventEnvelope) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        // Correlation scope: message id plus the message's correlation
        // id, or a generated one so downstream log lines always join up.
        let correlation_id = message
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::info_span!(
            "invoke_subscriber",
            message_id = %message.message_id,
            correlation_id = %correlation_id,
            delivery_count = message.delivery_count,
        );

        self.process(message, lock, handler, cancel)
            .instrument(span)
            .await
    }

    async fn process<H, Fut>(
        &self,
        message: &ReceivedMessage,
        lock: &dyn MessageLock,
        handler: H,
        cancel: &CancellationToken,
    ) -> Result<Outcome, InvokeError>
    where
        H: FnOnce(EventEnvelope) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        // Metadata-only conversion first: the diagnostic fields are
        // available even if body decoding fails below.
        let metadata = self.converter.metadata_only(message);
        tracing::debug!(
            subject = %metadata.subject.as_deref().unwrap_or(""),
            action = %metadata.action.as_deref().unwrap_or(""),
            tenant_id = %metadata.tenant_id.as_deref().unwrap_or(""),
            "Processing message"
        );

        let result = match self.converter.from_native(message) {
            Ok(envelope) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
                    result = handler(envelope) => result,
                }
            }
            // A body that cannot be decoded will never decode on
            // redelivery; classify as terminal.
            Err(e) => Err(HandlerError::terminal(format!(
                "failed to convert message: {e}"
            ))
            .with_category("conversion")),
        };

        match result {
            Ok(()) => {
                lock.complete().await?;
                tracing::debug!(outcome = %Outcome::Completed, "Message completed");
                Ok(Outcome::Completed)
            }
            Err(error) => self.apply_policy(message, lock, error, cancel).await,
        }
    }

    /// Policy layer: classify the failure, then dead-letter, delay,
    /// abandon or rethrow.
    async fn apply_policy(
        &self,
        message: &ReceivedMessage,
        lock: &dyn MessageLock,
        error: HandlerError,
        cancel: &CancellationToken,
    ) -> Result<Outcome, InvokeError> {
        if !error.is_transient() {
            let reason = error.category().unwrap_or(UNHANDLED_CATEGORY).to_string();
            let description = truncate_reason(error.message());
            tracing::error!(
                reason = %reason,
                error = %error,
                "Non-transient handler failure; dead-lettering"
            );
            lock.dead_letter(BTreeMap::new(), &reason, &description)
                .await?;
            return Ok(Outcome::DeadLettered { reason });
        }

        let delay = self.policy.retry_backoff(message.delivery_count);
        tracing::warn!(
            delivery_count = message.delivery_count,
            delay_ms = delay.as_millis() as u64,
            outcome = %Outcome::Retrying { delay },
            error = %error,
            "Transient handler failure"
        );

        if let Some(max) = self.policy.max_delivery_count {
            if message.delivery_count >= max {
                let description = truncate_reason(error.message());
                tracing::error!(
                    delivery_count = message.delivery_count,
                    max_delivery_count = max,
                    "Delivery count ceiling reached; dead-lettering"
                );
                lock.dead_letter(BTreeMap::new(), MAX_DELIVERY_COUNT_REASON, &description)
                    .await?;
                return Ok(Outcome::DeadLettered {
                    reason: MAX_DELIVERY_COUNT_REASON.to_string(),
                });
            }
        }

        if delay > Duration::ZERO {
            // Keep the broker from redelivering mid-delay.
            lock.renew_lock().await?;
            tokio::select! {
                _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.policy.abandon_on_transient {
            let reason = truncate_reason(error.message());
            let mut properties = BTreeMap::new();
            properties.insert(ABANDON_REASON_PROPERTY.to_string(), reason.clone());
            lock.abandon(properties).await?;
            return Ok(Outcome::Abandoned { reason });
        }

        Err(InvokeError::Handler(error))
    }
}

/// Truncate reason text to the broker metadata size limit on a char
/// boundary
fn truncate_reason(text: &str) -> String {
    if text.chars().count() <= MAX_REASON_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_REASON_CHARS).collect()
}
