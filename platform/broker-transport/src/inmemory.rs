//! In-memory implementation of the broker transport for testing and development

use crate::{
    BrokerError, BrokerResult, BrokerSender, BrokerTransport, Delivery, MessageBatch, MessageLock,
    NativeMessage, ReceiveMode, ReceiveTarget, ReceivedMessage, SubQueue,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Matches the common broker default for a single batch.
const DEFAULT_MAX_BATCH_BYTES: usize = 256 * 1024;

/// Application-property key carrying the dead-letter reason
pub const DEAD_LETTER_REASON_PROPERTY: &str = "DeadLetterReason";
/// Application-property key carrying the dead-letter description
pub const DEAD_LETTER_DESCRIPTION_PROPERTY: &str = "DeadLetterErrorDescription";

/// Broker transport implementation backed by in-process queues.
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated brokers
///
/// Semantics follow the real thing closely enough for the reliability
/// layer: per-entity FIFO queues, dead-letter sub-queues, delivery
/// counts incremented on every hand-out, abandon returning the message
/// to the head of its queue, and once-only settlement enforced per
/// lock. Dropping an unsettled peek-lock requeues the message (the
/// in-process stand-in for lock expiry). Receives never block: an
/// empty queue returns an empty vec immediately regardless of
/// `max_wait`.
///
/// # Example
/// ```rust
/// use broker_transport::{BrokerTransport, InMemoryBroker, NativeMessage, ReceiveMode, ReceiveTarget};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let sender = broker.create_sender("orders").await?;
///
/// let mut batch = sender.create_batch();
/// batch.try_add(&NativeMessage::new("m1".to_string(), b"payload".to_vec()));
/// sender.send_batch(batch).await?;
///
/// let deliveries = broker
///     .receive(&ReceiveTarget::queue("orders"), 10, Duration::ZERO, ReceiveMode::PeekLock)
///     .await?;
/// assert_eq!(deliveries.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    max_batch_bytes: usize,
    entities: Mutex<HashMap<String, Entity>>,
    sent_batches: Mutex<Vec<SentBatch>>,
}

/// Record of one batch accepted by the in-memory broker (for test assertions)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBatch {
    pub destination: String,
    pub message_count: usize,
}

#[derive(Default)]
struct Entity {
    active: VecDeque<Stored>,
    dead: VecDeque<Stored>,
    deferred: Vec<Stored>,
    /// Subscription names when this entity is a topic
    subscriptions: Vec<String>,
}

#[derive(Clone)]
struct Stored {
    message: NativeMessage,
    delivery_count: u32,
}

impl InMemoryBroker {
    /// Create a new in-memory broker with the default batch size limit
    pub fn new() -> Self {
        Self::with_max_batch_bytes(DEFAULT_MAX_BATCH_BYTES)
    }

    /// Create a new in-memory broker with a custom batch size limit.
    ///
    /// Small limits are useful to exercise batching paths in tests.
    pub fn with_max_batch_bytes(max_batch_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_batch_bytes,
                entities: Mutex::new(HashMap::new()),
                sent_batches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a subscription on a topic. Subsequent sends to the
    /// topic fan out a copy of each message to every subscription.
    pub fn create_subscription(&self, destination: &str, subscription: &str) {
        let mut entities = self.inner.entities.lock().unwrap_or_else(|e| e.into_inner());
        let topic = entities.entry(destination.to_string()).or_default();
        if !topic.subscriptions.iter().any(|s| s == subscription) {
            topic.subscriptions.push(subscription.to_string());
        }
        entities
            .entry(Inner::entity_key(destination, Some(subscription)))
            .or_default();
    }

    /// Batches accepted so far, in send order (for test assertions)
    pub fn sent_batches(&self) -> Vec<SentBatch> {
        self.inner
            .sent_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of messages currently queued on the target
    pub fn queue_len(&self, target: &ReceiveTarget) -> usize {
        let entities = self.inner.entities.lock().unwrap_or_else(|e| e.into_inner());
        let key = Inner::entity_key(&target.destination, target.subscription.as_deref());
        entities
            .get(&key)
            .map(|entity| match target.sub_queue {
                SubQueue::None => entity.active.len(),
                SubQueue::DeadLetter => entity.dead.len(),
            })
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn entity_key(destination: &str, subscription: Option<&str>) -> String {
        match subscription {
            Some(sub) => format!("{destination}/{sub}"),
            None => destination.to_string(),
        }
    }

    fn enqueue(&self, destination: &str, messages: Vec<NativeMessage>) {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        let subscriptions = entities
            .entry(destination.to_string())
            .or_default()
            .subscriptions
            .clone();

        if subscriptions.is_empty() {
            let queue = entities.entry(destination.to_string()).or_default();
            queue
                .active
                .extend(messages.into_iter().map(|message| Stored {
                    message,
                    delivery_count: 0,
                }));
        } else {
            for sub in subscriptions {
                let key = Self::entity_key(destination, Some(&sub));
                let entity = entities.entry(key).or_default();
                entity
                    .active
                    .extend(messages.iter().cloned().map(|message| Stored {
                        message,
                        delivery_count: 0,
                    }));
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn create_sender(&self, destination: &str) -> BrokerResult<Box<dyn BrokerSender>> {
        Ok(Box::new(InMemorySender {
            inner: Arc::clone(&self.inner),
            destination: destination.to_string(),
        }))
    }

    async fn receive(
        &self,
        target: &ReceiveTarget,
        max_count: usize,
        _max_wait: Duration,
        mode: ReceiveMode,
    ) -> BrokerResult<Vec<Delivery>> {
        let key = Inner::entity_key(&target.destination, target.subscription.as_deref());
        let mut entities = self.inner.entities.lock().unwrap_or_else(|e| e.into_inner());
        let entity = entities.entry(key.clone()).or_default();

        let queue = match target.sub_queue {
            SubQueue::None => &mut entity.active,
            SubQueue::DeadLetter => &mut entity.dead,
        };

        let mut deliveries = Vec::new();
        while deliveries.len() < max_count {
            let Some(mut stored) = queue.pop_front() else {
                break;
            };
            stored.delivery_count += 1;

            let message = ReceivedMessage::from_native(stored.message.clone(), stored.delivery_count);
            let lock: Box<dyn MessageLock> = match mode {
                ReceiveMode::PeekLock => Box::new(InMemoryLock {
                    inner: Arc::clone(&self.inner),
                    entity_key: key.clone(),
                    sub_queue: target.sub_queue,
                    stored: Mutex::new(Some(stored)),
                }),
                ReceiveMode::ReceiveAndDelete => Box::new(InertLock),
            };
            deliveries.push(Delivery { message, lock });
        }

        if !deliveries.is_empty() {
            tracing::debug!(
                target = %target,
                received = deliveries.len(),
                mode = ?mode,
                "Handed out messages"
            );
        }
        Ok(deliveries)
    }
}

struct InMemorySender {
    inner: Arc<Inner>,
    destination: String,
}

#[async_trait]
impl BrokerSender for InMemorySender {
    fn create_batch(&self) -> MessageBatch {
        MessageBatch::new(self.inner.max_batch_bytes)
    }

    async fn send_batch(&self, batch: MessageBatch) -> BrokerResult<()> {
        let messages = batch.into_messages();
        tracing::debug!(
            destination = %self.destination,
            message_count = messages.len(),
            "Accepted batch"
        );
        self.inner
            .sent_batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentBatch {
                destination: self.destination.clone(),
                message_count: messages.len(),
            });
        self.inner.enqueue(&self.destination, messages);
        Ok(())
    }
}

/// Lock handed out in peek-lock mode; holds the message until settled.
///
/// Dropping the lock without a terminal action stands in for lock
/// expiry: the message goes back to the head of its queue so the next
/// receive redelivers it.
struct InMemoryLock {
    inner: Arc<Inner>,
    entity_key: String,
    sub_queue: SubQueue,
    stored: Mutex<Option<Stored>>,
}

impl InMemoryLock {
    fn take(&self) -> BrokerResult<Stored> {
        self.stored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                BrokerError::AlreadySettled(format!(
                    "a terminal action was already applied on {}",
                    self.entity_key
                ))
            })
    }

    fn with_entity<R>(&self, f: impl FnOnce(&mut Entity) -> R) -> R {
        let mut entities = self.inner.entities.lock().unwrap_or_else(|e| e.into_inner());
        let entity = entities.entry(self.entity_key.clone()).or_default();
        f(entity)
    }
}

impl Drop for InMemoryLock {
    fn drop(&mut self) {
        let stored = self
            .stored
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(stored) = stored {
            self.with_entity(|entity| match self.sub_queue {
                SubQueue::None => entity.active.push_front(stored),
                SubQueue::DeadLetter => entity.dead.push_front(stored),
            });
        }
    }
}

#[async_trait]
impl MessageLock for InMemoryLock {
    async fn complete(&self) -> BrokerResult<()> {
        self.take().map(|_| ())
    }

    async fn abandon(&self, properties_to_modify: BTreeMap<String, String>) -> BrokerResult<()> {
        let mut stored = self.take()?;
        stored.message.application_properties.extend(properties_to_modify);
        self.with_entity(|entity| match self.sub_queue {
            SubQueue::None => entity.active.push_front(stored),
            SubQueue::DeadLetter => entity.dead.push_front(stored),
        });
        Ok(())
    }

    async fn dead_letter(
        &self,
        properties_to_modify: BTreeMap<String, String>,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()> {
        let mut stored = self.take()?;
        stored.message.application_properties.extend(properties_to_modify);
        stored
            .message
            .application_properties
            .insert(DEAD_LETTER_REASON_PROPERTY.to_string(), reason.to_string());
        stored.message.application_properties.insert(
            DEAD_LETTER_DESCRIPTION_PROPERTY.to_string(),
            description.to_string(),
        );
        self.with_entity(|entity| entity.dead.push_back(stored));
        Ok(())
    }

    async fn defer(&self) -> BrokerResult<()> {
        let stored = self.take()?;
        self.with_entity(|entity| entity.deferred.push(stored));
        Ok(())
    }

    async fn renew_lock(&self) -> BrokerResult<()> {
        let guard = self.stored.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            Ok(())
        } else {
            Err(BrokerError::LockLost(format!(
                "lock on {} was already settled",
                self.entity_key
            )))
        }
    }
}

/// Lock returned in receive-and-delete mode; every action is a no-op
/// because settlement already happened on receive.
struct InertLock;

#[async_trait]
impl MessageLock for InertLock {
    async fn complete(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn abandon(&self, _properties_to_modify: BTreeMap<String, String>) -> BrokerResult<()> {
        Ok(())
    }

    async fn dead_letter(
        &self,
        _properties_to_modify: BTreeMap<String, String>,
        _reason: &str,
        _description: &str,
    ) -> BrokerResult<()> {
        Ok(())
    }

    async fn defer(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn renew_lock(&self) -> BrokerResult<()> {
        Ok(())
    }
}
