//! Bounded, failure-tolerant calls into the operation controller.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::operation::OperationContext;
use crate::traits::{OperationController, OperationStatus};

/// Wraps an `OperationController` so that a slow or failing controller can
/// never hold up or break message settlement. Failures are logged and counted.
#[derive(Clone)]
pub struct StatusNotifier {
    controller: Arc<dyn OperationController>,
    timeout: Duration,
}

impl StatusNotifier {
    #[must_use]
    pub fn new(controller: Arc<dyn OperationController>, timeout: Duration) -> Self {
        Self {
            controller,
            timeout,
        }
    }

    /// Report `status` for `operation_id`. Never fails.
    pub async fn notify(&self, ctx: &OperationContext, status: OperationStatus, operation_id: &str) {
        let call = async {
            match status {
                OperationStatus::Pending => self.controller.mark_pending(ctx, operation_id).await,
                OperationStatus::InProgress => {
                    self.controller.mark_in_progress(ctx, operation_id).await
                }
                OperationStatus::Completed => {
                    self.controller.mark_completed(ctx, operation_id).await
                }
                OperationStatus::Cancelled => {
                    self.controller.mark_cancelled(ctx, operation_id).await
                }
            }
        };

        let failure = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error.to_string(),
            Err(_elapsed) => format!("timed out after {}ms", self.timeout.as_millis()),
        };
        warn!(
            operation_id,
            status = status.as_str(),
            error = %failure,
            "operation controller notification failed"
        );
        metrics::counter!("opbus_controller_failures_total", "status" => status.as_str())
            .increment(1);
    }
}
