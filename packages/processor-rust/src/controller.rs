//! Operation controller implementations shipped with the processor.
//!
//! Real deployments back the controller with a persistent status store; these
//! cover processes that do not track status and tests that assert on it.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::service::OperationContext;
use crate::traits::{OperationController, OperationStatus};

// ---------------------------------------------------------------------------
// NoopController
// ---------------------------------------------------------------------------

/// Controller that accepts every notification and records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopController;

#[async_trait]
impl OperationController for NoopController {
    async fn mark_pending(&self, _ctx: &OperationContext, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_in_progress(&self, _ctx: &OperationContext, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_completed(&self, _ctx: &OperationContext, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_cancelled(&self, _ctx: &OperationContext, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryController
// ---------------------------------------------------------------------------

/// In-process status table with an ordered log of every accepted call.
///
/// Repeating a call for the same operation id just rewrites the same status,
/// so duplicates from at-least-once delivery are harmless.
#[derive(Debug, Default)]
pub struct InMemoryController {
    statuses: DashMap<String, OperationStatus>,
    calls: Mutex<Vec<(OperationStatus, String)>>,
    failing: AtomicBool,
}

impl InMemoryController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn status(&self, operation_id: &str) -> Option<OperationStatus> {
        self.statuses.get(operation_id).map(|entry| *entry.value())
    }

    /// Accepted calls in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<(OperationStatus, String)> {
        self.calls.lock().clone()
    }

    /// Number of accepted calls reporting `status`.
    #[must_use]
    pub fn count(&self, status: OperationStatus) -> usize {
        self.calls.lock().iter().filter(|(s, _)| *s == status).count()
    }

    /// Number of operations currently in a terminal status.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|entry| entry.value().is_terminal())
            .count()
    }

    fn record(&self, status: OperationStatus, operation_id: &str) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("status store unavailable");
        }
        self.statuses.insert(operation_id.to_string(), status);
        self.calls.lock().push((status, operation_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl OperationController for InMemoryController {
    async fn mark_pending(&self, _ctx: &OperationContext, id: &str) -> anyhow::Result<()> {
        self.record(OperationStatus::Pending, id)
    }

    async fn mark_in_progress(&self, _ctx: &OperationContext, id: &str) -> anyhow::Result<()> {
        self.record(OperationStatus::InProgress, id)
    }

    async fn mark_completed(&self, _ctx: &OperationContext, id: &str) -> anyhow::Result<()> {
        self.record(OperationStatus::Completed, id)
    }

    async fn mark_cancelled(&self, _ctx: &OperationContext, id: &str) -> anyhow::Result<()> {
        self.record(OperationStatus::Cancelled, id)
    }
}
