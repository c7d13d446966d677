//! Transport helpers and the in-memory queue.

pub mod memory;

pub use memory::InMemoryQueue;

use bytes::Bytes;
use opbus_core::{OperationRequest, WireCodec};
use tracing::info;

use crate::traits::MessageSender;

/// Serialize `request` as-is and enqueue it as a new delivery.
///
/// This is what a typical `ApiOperation::retry` delegates to. The pipeline has
/// already incremented the retry count by the time `retry` runs, so the
/// request is not modified here.
///
/// # Errors
///
/// Returns an error if the request fails to encode or the sender rejects it.
pub async fn requeue(
    sender: &dyn MessageSender,
    codec: WireCodec,
    request: &OperationRequest,
) -> anyhow::Result<()> {
    let body = codec.encode(request)?;
    info!(
        operation = %request.operation_name,
        operation_id = %request.operation_id,
        retry_count = request.retry_count,
        "re-enqueueing operation"
    );
    sender.send_message(Bytes::from(body)).await
}
