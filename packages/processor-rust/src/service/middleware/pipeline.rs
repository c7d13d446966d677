//! Composes the middleware layers around the `MessageHandler`.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::lock_renewal::{LockRenewalLayer, LockRenewalService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::service::config::ProcessorConfig;
use crate::service::handler::MessageHandler;
use crate::traits::MessageReceiver;

/// The assembled per-message service stack.
pub type MessagePipeline = MetricsService<LockRenewalService<MessageHandler>>;

/// Wrap `handler` with the message middleware.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span, disposition counter, and duration for the whole attempt
/// 2. `LockRenewalLayer` -- keep the transport lock alive while the handler runs
#[must_use]
pub fn build_message_pipeline(
    handler: MessageHandler,
    receiver: Arc<dyn MessageReceiver>,
    config: &ProcessorConfig,
) -> MessagePipeline {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(LockRenewalLayer::new(receiver, config.lock_renewal_interval))
        .service(handler)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opbus_core::{OperationRequest, WireCodec};
    use tower::ServiceExt;

    use super::*;
    use crate::controller::InMemoryController;
    use crate::service::classify::Disposition;
    use crate::service::handler::Delivery;
    use crate::service::notify::StatusNotifier;
    use crate::service::registry::OperationRegistry;
    use crate::service::test_support::{encode, Script, ScriptedOperation};
    use crate::transport::InMemoryQueue;

    #[tokio::test]
    async fn pipeline_drives_handler_through_all_layers() {
        let registry = Arc::new(OperationRegistry::new());
        let script = Arc::new(Script::default());
        registry.register("Deploy", move || ScriptedOperation::new(script.clone()));

        let handler = MessageHandler::new(
            registry,
            StatusNotifier::new(Arc::new(InMemoryController::new()), Duration::from_secs(1)),
            WireCodec::Json,
        );
        let queue = Arc::new(InMemoryQueue::new());
        let svc = build_message_pipeline(handler, queue.clone(), &ProcessorConfig::default());

        let request = OperationRequest::new("Deploy", "v1", "op-7", "c-1", "ManagedCluster");
        queue.enqueue(encode(&request)).unwrap();
        let message = queue.receive().await.unwrap().unwrap();

        let disposition = svc.oneshot(Delivery::new(message)).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::Completed {
                operation_id: "op-7".to_string()
            }
        );
    }
}
