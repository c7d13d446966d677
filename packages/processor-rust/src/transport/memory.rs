//! In-memory durable-queue stand-in for tests and the demo binary.
//!
//! Messages are handed out in FIFO order. Settlements and lock renewals are
//! recorded per message id so tests can assert on them, and both can be told
//! to fail for fault injection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::traits::{MessageReceiver, MessageSender, ReceivedMessage};

#[derive(Debug, Default)]
pub struct InMemoryQueue {
    pending: Mutex<VecDeque<ReceivedMessage>>,
    available: Notify,
    closed: AtomicBool,
    completed: Mutex<Vec<String>>,
    renewals: DashMap<String, u32>,
    fail_completion: AtomicBool,
    fail_renewal: AtomicBool,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a body and return the message id assigned to it.
    ///
    /// # Errors
    ///
    /// Returns an error once the queue has been closed.
    pub fn enqueue(&self, body: impl Into<Bytes>) -> anyhow::Result<String> {
        if self.is_closed() {
            anyhow::bail!("queue is closed");
        }
        let message_id = Uuid::new_v4().to_string();
        self.pending.lock().push_back(ReceivedMessage {
            message_id: message_id.clone(),
            body: body.into(),
            delivery_count: 1,
        });
        self.available.notify_one();
        Ok(message_id)
    }

    /// Stop accepting messages. `receive` returns `None` once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Message ids in settlement order. Duplicates mean a double settle.
    #[must_use]
    pub fn completed_ids(&self) -> Vec<String> {
        self.completed.lock().clone()
    }

    #[must_use]
    pub fn completion_count(&self, message_id: &str) -> usize {
        self.completed
            .lock()
            .iter()
            .filter(|id| id.as_str() == message_id)
            .count()
    }

    #[must_use]
    pub fn renewal_count(&self, message_id: &str) -> u32 {
        self.renewals.get(message_id).map_or(0, |entry| *entry.value())
    }

    pub fn set_fail_completion(&self, fail: bool) {
        self.fail_completion.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_renewal(&self, fail: bool) {
        self.fail_renewal.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageReceiver for InMemoryQueue {
    async fn receive(&self) -> anyhow::Result<Option<ReceivedMessage>> {
        loop {
            let notified = self.available.notified();
            let next = self.pending.lock().pop_front();
            if let Some(message) = next {
                return Ok(Some(message));
            }
            if self.is_closed() {
                // Pass the wakeup on so other waiting receivers also observe the close.
                self.available.notify_one();
                return Ok(None);
            }
            notified.await;
        }
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        // Recorded even when failing so tests can count settle attempts.
        self.completed.lock().push(message.message_id.clone());
        if self.fail_completion.load(Ordering::SeqCst) {
            anyhow::bail!("settlement rejected for message {}", message.message_id);
        }
        Ok(())
    }

    async fn renew_lock(&self, message: &ReceivedMessage) -> anyhow::Result<()> {
        if self.fail_renewal.load(Ordering::SeqCst) {
            anyhow::bail!("lock lost for message {}", message.message_id);
        }
        *self.renewals.entry(message.message_id.clone()).or_insert(0) += 1;
        Ok(())
    }
}

#[async_trait]
impl MessageSender for InMemoryQueue {
    async fn send_message(&self, body: Bytes) -> anyhow::Result<()> {
        self.enqueue(body).map(|_| ())
    }
}
