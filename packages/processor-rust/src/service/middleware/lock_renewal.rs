//! Keeps the transport lock on an in-flight message alive.
//!
//! While the inner service runs, the lock is renewed every `interval`. If a
//! renewal fails the delivery's cancellation token fires, so every stage
//! running under `OperationContext::scope` aborts; the inner service is still
//! driven to completion so it can schedule the retry.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::service::classify::Disposition;
use crate::service::handler::{Delivery, PipelineFuture};
use crate::traits::{MessageReceiver, ReceivedMessage};

// ---------------------------------------------------------------------------
// LockRenewalLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LockRenewalLayer {
    receiver: Arc<dyn MessageReceiver>,
    interval: Duration,
}

impl LockRenewalLayer {
    /// A zero `interval` disables renewal.
    #[must_use]
    pub fn new(receiver: Arc<dyn MessageReceiver>, interval: Duration) -> Self {
        Self { receiver, interval }
    }
}

impl<S> Layer<S> for LockRenewalLayer {
    type Service = LockRenewalService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LockRenewalService {
            inner,
            receiver: Arc::clone(&self.receiver),
            interval: self.interval,
        }
    }
}

// ---------------------------------------------------------------------------
// LockRenewalService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LockRenewalService<S> {
    inner: S,
    receiver: Arc<dyn MessageReceiver>,
    interval: Duration,
}

impl<S> Service<Delivery> for LockRenewalService<S>
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
        let receiver = Arc::clone(&self.receiver);
        let interval = self.interval;
        let message = delivery.message.clone();
        let cancellation = delivery.ctx.cancellation.clone();
        let fut = self.inner.call(delivery);

        Box::pin(async move {
            tokio::pin!(fut);
            tokio::select! {
                result = &mut fut => result,
                () = keep_lock_alive(receiver.as_ref(), &message, interval, &cancellation) => {
                    fut.await
                }
            }
        })
    }
}

/// Renew until a renewal fails, then cancel the delivery and return.
async fn keep_lock_alive(
    receiver: &dyn MessageReceiver,
    message: &ReceivedMessage,
    interval: Duration,
    cancellation: &CancellationToken,
) {
    if interval.is_zero() {
        return std::future::pending().await;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; the lock is fresh on receive.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match receiver.renew_lock(message).await {
            Ok(()) => debug!(message_id = %message.message_id, "message lock renewed"),
            Err(error) => {
                warn!(
                    message_id = %message.message_id,
                    error = %error,
                    "lock renewal failed, cancelling in-flight operation"
                );
                cancellation.cancel();
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::transport::InMemoryQueue;

    async fn received(queue: &InMemoryQueue) -> Delivery {
        queue.enqueue("body").unwrap();
        Delivery::new(queue.receive().await.unwrap().unwrap())
    }

    fn finished(reason: &str) -> Disposition {
        Disposition::Dropped {
            operation_id: None,
            reason: reason.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renews_while_inner_service_runs() {
        let queue = Arc::new(InMemoryQueue::new());
        let delivery = received(&queue).await;
        let message_id = delivery.message.message_id.clone();

        let inner = tower::service_fn(|_d: Delivery| async {
            tokio::time::sleep(Duration::from_secs(35)).await;
            Ok::<_, Infallible>(finished("slow"))
        });
        let svc = LockRenewalLayer::new(queue.clone(), Duration::from_secs(10)).layer(inner);

        assert_eq!(svc.oneshot(delivery).await.unwrap(), finished("slow"));
        assert_eq!(queue.renewal_count(&message_id), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_delivery_never_renews() {
        let queue = Arc::new(InMemoryQueue::new());
        let delivery = received(&queue).await;
        let message_id = delivery.message.message_id.clone();

        let inner = tower::service_fn(|_d: Delivery| async { Ok::<_, Infallible>(finished("fast")) });
        let svc = LockRenewalLayer::new(queue.clone(), Duration::from_secs(10)).layer(inner);

        svc.oneshot(delivery).await.unwrap();
        assert_eq!(queue.renewal_count(&message_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lock_cancels_the_delivery() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.set_fail_renewal(true);
        let delivery = received(&queue).await;

        let inner = tower::service_fn(|d: Delivery| async move {
            d.ctx.cancellation.cancelled().await;
            Ok::<_, Infallible>(finished("cancelled"))
        });
        let svc = LockRenewalLayer::new(queue, Duration::from_secs(10)).layer(inner);

        let disposition = tokio::time::timeout(Duration::from_secs(60), svc.oneshot(delivery))
            .await
            .expect("inner service observed cancellation")
            .unwrap();
        assert_eq!(disposition, finished("cancelled"));
    }
}
