//! Failure classification: maps a `StageError` to the action the pipeline takes
//! and describes the terminal state of each delivery attempt.

use super::operation::StageError;
use crate::traits::OperationStatus;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Recovery chosen for a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Settle without executing anything further. The failure cannot change
    /// on redelivery.
    Drop,
    /// Settle and report the logical operation as cancelled.
    Cancel,
    /// Re-enqueue through the live operation, then settle.
    Retry,
}

/// Decide how to recover from `error`.
///
/// Failures before an operation instance exists (decode, retry ceiling,
/// registry miss) can only drop or cancel; every failure with a live
/// operation is retried.
#[must_use]
pub fn classify(error: &StageError) -> Action {
    match error {
        StageError::RetryLimitExceeded { .. } => Action::Cancel,
        StageError::Decode(_) | StageError::UnknownOperationType { .. } => Action::Drop,
        other if other.stage().has_operation() => Action::Retry,
        _ => Action::Drop,
    }
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// Terminal state of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// `run` succeeded.
    Completed { operation_id: String },
    /// A stage failed and the operation was re-enqueued with `retry_count`.
    RetryScheduled {
        operation_id: String,
        retry_count: u32,
        reason: String,
    },
    /// The logical operation will not progress any further.
    Cancelled { operation_id: String, reason: String },
    /// The message was unusable. `operation_id` is known whenever the
    /// envelope decoded.
    Dropped {
        operation_id: Option<String>,
        reason: String,
    },
}

impl Disposition {
    /// Build the disposition for a failure that happened without a live
    /// operation instance.
    #[must_use]
    pub fn without_operation(error: &StageError, operation_id: Option<String>) -> Self {
        let reason = error.to_string();
        match (classify(error), operation_id) {
            (Action::Cancel, Some(operation_id)) => Self::Cancelled {
                operation_id,
                reason,
            },
            (_, operation_id) => Self::Dropped {
                operation_id,
                reason,
            },
        }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Cancelled { .. } => "cancelled",
            Self::Dropped { .. } => "dropped",
        }
    }

    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Completed { operation_id }
            | Self::RetryScheduled { operation_id, .. }
            | Self::Cancelled { operation_id, .. } => Some(operation_id),
            Self::Dropped { operation_id, .. } => operation_id.as_deref(),
        }
    }

    /// Status to report to the operation controller, if any.
    ///
    /// Dropped messages report `Cancelled` whenever their operation id is
    /// known; an envelope that never decoded reports nothing.
    #[must_use]
    pub fn controller_status(&self) -> Option<OperationStatus> {
        match self {
            Self::Completed { .. } => Some(OperationStatus::Completed),
            Self::RetryScheduled { .. } => Some(OperationStatus::Pending),
            Self::Cancelled { .. } => Some(OperationStatus::Cancelled),
            Self::Dropped { operation_id, .. } => {
                operation_id.as_ref().map(|_| OperationStatus::Cancelled)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
