//! Per-delivery instrumentation: a `delivery` span, a disposition counter,
//! and a duration histogram.

use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::classify::Disposition;
use crate::service::handler::{Delivery, PipelineFuture};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records `opbus_messages_total{disposition}` and
/// `opbus_message_duration_seconds` for every delivery.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Delivery> for MetricsService<S>
where
    S: Service<Delivery, Response = Disposition, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Disposition;
    type Error = Infallible;
    type Future = PipelineFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let span = info_span!(
            "delivery",
            message_id = %delivery.message.message_id,
            delivery_count = delivery.message.delivery_count,
            disposition = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let fut = self.inner.call(delivery);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                if let Ok(disposition) = &result {
                    let label = disposition.label();
                    #[allow(clippy::cast_possible_truncation)]
                    let duration_ms = elapsed.as_millis() as u64;
                    tracing::Span::current().record("disposition", label);
                    tracing::Span::current().record("duration_ms", duration_ms);
                    tracing::info!(disposition = label, duration_ms, "delivery finished");

                    ::metrics::counter!("opbus_messages_total", "disposition" => label).increment(1);
                    ::metrics::histogram!("opbus_message_duration_seconds", "disposition" => label)
                        .record(elapsed.as_secs_f64());
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::traits::ReceivedMessage;

    fn delivery() -> Delivery {
        Delivery::new(ReceivedMessage {
            message_id: "m-1".to_string(),
            body: Bytes::from_static(b"{}"),
            delivery_count: 2,
        })
    }

    #[tokio::test]
    async fn passes_disposition_through() {
        let inner = tower::service_fn(|d: Delivery| async move {
            Ok::<_, Infallible>(Disposition::Dropped {
                operation_id: None,
                reason: d.message.message_id,
            })
        });
        let svc = MetricsLayer.layer(inner);

        let disposition = svc.oneshot(delivery()).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::Dropped {
                operation_id: None,
                reason: "m-1".to_string(),
            }
        );
    }
}
