//! Per-message state machine with two fault-isolation boundaries.
//!
//! 1. **Outer boundary** (decode + retry ceiling + registry lookup): no
//!    operation instance exists yet, so failures can only drop or cancel.
//! 2. **Inner boundary** (init through run): a live operation exists, so every
//!    failure bumps the retry count and calls `ApiOperation::retry`.
//!
//! Panics raised by operation code are caught at the nearest boundary and
//! classified like any other failure of the stage they came from. The handler
//! never settles messages itself; it returns a `Disposition` and the caller
//! settles exactly once.

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use opbus_core::{OperationRequest, OperationResult, WireCodec, MAX_RETRY_COUNT};
use tower::Service;
use tracing::{error, info, info_span, warn, Instrument};

use super::classify::{classify, Action, Disposition};
use super::notify::StatusNotifier;
use super::operation::{ApiOperation, OperationContext, Stage, StageError};
use super::registry::{OperationRegistry, RegistryError};
use crate::traits::{OperationStatus, ReceivedMessage};

/// Future returned by every service in the message pipeline.
pub type PipelineFuture = Pin<Box<dyn Future<Output = Result<Disposition, Infallible>> + Send>>;

/// One delivery attempt: the received message plus its context.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: ReceivedMessage,
    pub ctx: OperationContext,
}

impl Delivery {
    #[must_use]
    pub fn new(message: ReceivedMessage) -> Self {
        let ctx = OperationContext::new(message.message_id.clone());
        Self { message, ctx }
    }
}

type Matched = (OperationRequest, Box<dyn ApiOperation>);

// ---------------------------------------------------------------------------
// MessageHandler
// ---------------------------------------------------------------------------

/// Innermost pipeline service: decodes, instantiates, and drives one operation
/// through its lifecycle.
#[derive(Clone)]
pub struct MessageHandler {
    registry: Arc<OperationRegistry>,
    notifier: StatusNotifier,
    codec: WireCodec,
}

impl MessageHandler {
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>, notifier: StatusNotifier, codec: WireCodec) -> Self {
        Self {
            registry,
            notifier,
            codec,
        }
    }

    /// Process one delivery attempt to its terminal disposition.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let Delivery { message, ctx } = delivery;

        let mut stage = Stage::Decode;
        let mut operation_id = None;
        let matched = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.match_operation(&message.body, &mut stage, &mut operation_id)
        }))
        .unwrap_or_else(|payload| Err(StageError::from_panic(stage, payload.as_ref())));

        match matched {
            Ok((request, operation)) => self.execute(operation, request, &ctx).await,
            Err(error) => {
                match &error {
                    StageError::RetryLimitExceeded { .. } => {
                        warn!(message_id = %message.message_id, operation_id = ?operation_id, %error, "operation reached the retry limit");
                    }
                    _ => {
                        error!(message_id = %message.message_id, operation_id = ?operation_id, stage = %error.stage(), %error, "message cannot be processed");
                    }
                }
                Disposition::without_operation(&error, operation_id)
            }
        }
    }

    /// Outer boundary: decode, enforce the retry ceiling, instantiate.
    fn match_operation(
        &self,
        body: &[u8],
        stage: &mut Stage,
        operation_id: &mut Option<String>,
    ) -> Result<Matched, StageError> {
        let request = self.codec.decode(body)?;
        *operation_id = Some(request.operation_id.clone()).filter(|id| !id.is_empty());

        if request.has_reached_retry_limit() {
            return Err(StageError::RetryLimitExceeded {
                retry_count: request.retry_count,
                limit: MAX_RETRY_COUNT,
            });
        }

        *stage = Stage::Match;
        let operation = self
            .registry
            .create_instance(&request.operation_name)
            .map_err(|RegistryError::UnknownOperationType(name)| {
                StageError::UnknownOperationType { name }
            })?;
        Ok((request, operation))
    }

    /// Inner boundary: run the lifecycle, then classify any failure.
    async fn execute(
        &self,
        mut operation: Box<dyn ApiOperation>,
        request: OperationRequest,
        ctx: &OperationContext,
    ) -> Disposition {
        let span = info_span!(
            "operation",
            operation = %operation.name(),
            operation_id = %request.operation_id,
            retry_count = request.retry_count,
        );
        let operation_id = request.operation_id.clone();
        let incoming = request.clone();

        async move {
            let mut stage = Stage::Init;
            let outcome =
                AssertUnwindSafe(self.run_lifecycle(operation.as_mut(), request, ctx, &mut stage))
                    .catch_unwind()
                    .await;

            let error = match outcome {
                Ok(Ok(result)) => {
                    info!(
                        status_code = result.status_code,
                        message = %result.message,
                        "operation run successfully"
                    );
                    return Disposition::Completed { operation_id };
                }
                Ok(Err(error)) => error,
                Err(payload) => StageError::from_panic(stage, payload.as_ref()),
            };

            match classify(&error) {
                Action::Retry => {
                    // A failed init may not have bound the envelope.
                    if error.stage() == Stage::Init {
                        *operation.operation_request_mut() = incoming;
                    }
                    self.schedule_retry(operation.as_mut(), ctx, error).await
                }
                Action::Cancel | Action::Drop => {
                    error!(stage = %error.stage(), %error, "operation cannot be retried");
                    Disposition::Cancelled {
                        operation_id,
                        reason: error.to_string(),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_lifecycle(
        &self,
        operation: &mut dyn ApiOperation,
        request: OperationRequest,
        ctx: &OperationContext,
        stage: &mut Stage,
    ) -> Result<OperationResult, StageError> {
        *stage = Stage::Init;
        operation
            .init(ctx, request)
            .await
            .map_err(|source| StageError::failed(Stage::Init, source))?;

        *stage = Stage::NewContext;
        let op_ctx = operation
            .new_context_for_operation(ctx)
            .map_err(|source| StageError::failed(Stage::NewContext, source))?;

        *stage = Stage::EntityFetch;
        let entity = op_ctx
            .scope(operation.entity_fetcher(&op_ctx))
            .await
            .map_err(|reason| StageError::Aborted {
                stage: Stage::EntityFetch,
                reason,
            })?
            .map_err(|source| StageError::failed(Stage::EntityFetch, source))?;

        *stage = Stage::GuardConcurrency;
        op_ctx
            .scope(operation.guard_concurrency(&op_ctx, entity.as_ref()))
            .await
            .map_err(|reason| StageError::Aborted {
                stage: Stage::GuardConcurrency,
                reason,
            })?
            .map_err(StageError::Guarded)?;

        *stage = Stage::Run;
        let operation_id = operation.operation_request().operation_id.clone();
        self.notifier
            .notify(&op_ctx, OperationStatus::InProgress, &operation_id)
            .await;
        let mut result = op_ctx
            .scope(operation.run(&op_ctx))
            .await
            .map_err(|reason| StageError::Aborted {
                stage: Stage::Run,
                reason,
            })?;
        if let Some(source) = result.error.take() {
            return Err(StageError::failed(
                Stage::Run,
                source.context(format!("status {}", result.status_code)),
            ));
        }
        Ok(result)
    }

    /// Bump the retry count, re-enqueue through the operation, and report.
    async fn schedule_retry(
        &self,
        operation: &mut dyn ApiOperation,
        ctx: &OperationContext,
        error: StageError,
    ) -> Disposition {
        let reason = error.to_string();
        let request = operation.operation_request_mut();
        request.retry_count = request.retry_count.saturating_add(1);
        let retry_count = request.retry_count;
        let operation_id = request.operation_id.clone();

        warn!(
            stage = %error.stage(),
            error = %reason,
            next_retry_count = retry_count,
            "delivery attempt failed, scheduling retry"
        );

        let requeued = AssertUnwindSafe(operation.retry(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(anyhow::Error::new(StageError::from_panic(
                    Stage::Retry,
                    payload.as_ref(),
                )))
            });

        match requeued {
            Ok(()) => Disposition::RetryScheduled {
                operation_id,
                retry_count,
                reason,
            },
            Err(requeue_error) => {
                error!(error = %requeue_error, "operation could not be re-enqueued");
                Disposition::Cancelled {
                    operation_id,
                    reason: format!("{reason}; re-enqueue failed: {requeue_error}"),
                }
            }
        }
    }
}

impl Service<Delivery> for MessageHandler {
    type Response = Disposition;
    type Error = Infallible;
    type Future = PipelineFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle(delivery).await) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
