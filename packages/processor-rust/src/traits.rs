use async_trait::async_trait;
use bytes::Bytes;

use crate::service::OperationContext;

/// A message handed out by the transport, not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Transport-assigned identifier, used for settlement and lock renewal.
    pub message_id: String,
    /// Serialized `OperationRequest`.
    pub body: Bytes,
    /// How many times the transport has handed out this message instance.
    pub delivery_count: u32,
}

/// Receiving side of the durable queue.
/// Implementations: in-memory (tests, demo); cloud queues live outside this crate.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait for the next message. `None` means the queue is closed.
    async fn receive(&self) -> anyhow::Result<Option<ReceivedMessage>>;

    /// Settle a message so the transport never redelivers it.
    async fn complete_message(&self, message: &ReceivedMessage) -> anyhow::Result<()>;

    /// Extend the reservation on an unsettled message.
    async fn renew_lock(&self, message: &ReceivedMessage) -> anyhow::Result<()>;
}

/// Sending side of the durable queue, used to re-enqueue retries.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Enqueue a serialized envelope.
    async fn send_message(&self, body: Bytes) -> anyhow::Result<()>;
}

/// Externally observable status of a logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl OperationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled operations never change status again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Operation status store notified at pipeline transitions.
///
/// Calls are at-least-once: implementations must treat repeated calls with the
/// same operation id as idempotent. Errors are logged by the pipeline and never
/// affect message settlement.
#[async_trait]
pub trait OperationController: Send + Sync {
    async fn mark_pending(&self, ctx: &OperationContext, operation_id: &str) -> anyhow::Result<()>;

    async fn mark_in_progress(
        &self,
        ctx: &OperationContext,
        operation_id: &str,
    ) -> anyhow::Result<()>;

    async fn mark_completed(&self, ctx: &OperationContext, operation_id: &str)
        -> anyhow::Result<()>;

    async fn mark_cancelled(&self, ctx: &OperationContext, operation_id: &str)
        -> anyhow::Result<()>;
}
