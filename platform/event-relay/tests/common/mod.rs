//! Shared test doubles: a lock that records settlement calls and a
//! transport with scripted send failures.

// Each test binary uses a subset of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use broker_transport::{
    BrokerError, BrokerResult, BrokerSender, BrokerTransport, Delivery, MessageBatch, MessageLock,
    NativeMessage, ReceiveMode, ReceiveTarget,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAction {
    Complete,
    Abandon(BTreeMap<String, String>),
    DeadLetter { reason: String, description: String },
    Defer,
    RenewLock,
}

/// Message lock that records every call and always succeeds
#[derive(Default)]
pub struct RecordingLock {
    actions: Mutex<Vec<LockAction>>,
}

impl RecordingLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn actions(&self) -> Vec<LockAction> {
        self.actions.lock().unwrap().clone()
    }

    fn record(&self, action: LockAction) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl MessageLock for RecordingLock {
    async fn complete(&self) -> BrokerResult<()> {
        self.record(LockAction::Complete);
        Ok(())
    }

    async fn abandon(&self, properties_to_modify: BTreeMap<String, String>) -> BrokerResult<()> {
        self.record(LockAction::Abandon(properties_to_modify));
        Ok(())
    }

    async fn dead_letter(
        &self,
        _properties_to_modify: BTreeMap<String, String>,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()> {
        self.record(LockAction::DeadLetter {
            reason: reason.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }

    async fn defer(&self) -> BrokerResult<()> {
        self.record(LockAction::Defer);
        Ok(())
    }

    async fn renew_lock(&self) -> BrokerResult<()> {
        self.record(LockAction::RenewLock);
        Ok(())
    }
}

struct ScriptedState {
    batches: Vec<(String, Vec<NativeMessage>)>,
    sender_opens: Vec<String>,
    fail_after_batches: Option<usize>,
}

/// Transport that records batches and fails sends on cue
#[derive(Clone)]
pub struct ScriptedTransport {
    max_batch_bytes: usize,
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedTransport {
    pub fn new(max_batch_bytes: usize) -> Self {
        Self {
            max_batch_bytes,
            state: Arc::new(Mutex::new(ScriptedState {
                batches: Vec::new(),
                sender_opens: Vec::new(),
                fail_after_batches: None,
            })),
        }
    }

    /// Fail every `send_batch` after `n` batches have been accepted
    pub fn fail_after_batches(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_after_batches = Some(n);
        self
    }

    /// Accepted batches in send order: (destination, messages)
    pub fn batches(&self) -> Vec<(String, Vec<NativeMessage>)> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Destinations passed to `create_sender`, in order
    pub fn sender_opens(&self) -> Vec<String> {
        self.state.lock().unwrap().sender_opens.clone()
    }
}

#[async_trait]
impl BrokerTransport for ScriptedTransport {
    async fn create_sender(&self, destination: &str) -> BrokerResult<Box<dyn BrokerSender>> {
        let mut state = self.state.lock().unwrap();
        state.sender_opens.push(destination.to_string());
        Ok(Box::new(ScriptedSender {
            destination: destination.to_string(),
            max_batch_bytes: self.max_batch_bytes,
            state: Arc::clone(&self.state),
        }))
    }

    async fn receive(
        &self,
        _target: &ReceiveTarget,
        _max_count: usize,
        _max_wait: Duration,
        _mode: ReceiveMode,
    ) -> BrokerResult<Vec<Delivery>> {
        Ok(Vec::new())
    }
}

struct ScriptedSender {
    destination: String,
    max_batch_bytes: usize,
    state: Arc<Mutex<ScriptedState>>,
}

#[async_trait]
impl BrokerSender for ScriptedSender {
    fn create_batch(&self) -> MessageBatch {
        MessageBatch::new(self.max_batch_bytes)
    }

    async fn send_batch(&self, batch: MessageBatch) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = state.fail_after_batches {
            if state.batches.len() >= limit {
                return Err(BrokerError::SendError("scripted failure".to_string()));
            }
        }
        state
            .batches
            .push((self.destination.clone(), batch.into_messages()));
        Ok(())
    }
}
