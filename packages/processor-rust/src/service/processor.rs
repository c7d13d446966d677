//! Receive loop: pulls messages from the transport, dispatches each through
//! the message pipeline, settles it exactly once, and reports the outcome to
//! the operation controller.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::{error, info, warn};

use super::classify::Disposition;
use super::config::ProcessorConfig;
use super::handler::{Delivery, MessageHandler};
use super::middleware::{build_message_pipeline, MessagePipeline};
use super::notify::StatusNotifier;
use super::registry::OperationRegistry;
use crate::lifecycle::LifecycleController;
use crate::traits::{MessageReceiver, OperationController, ReceivedMessage};

struct ProcessorInner {
    receiver: Arc<dyn MessageReceiver>,
    pipeline: MessagePipeline,
    notifier: StatusNotifier,
    lifecycle: Arc<LifecycleController>,
    config: ProcessorConfig,
}

/// Consumes operation messages from a `MessageReceiver`.
///
/// Cloning is cheap; clones share the pipeline and lifecycle.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    #[must_use]
    pub fn new(
        receiver: Arc<dyn MessageReceiver>,
        registry: Arc<OperationRegistry>,
        controller: Arc<dyn OperationController>,
        config: ProcessorConfig,
    ) -> Self {
        let notifier = StatusNotifier::new(controller, config.controller_timeout);
        let handler = MessageHandler::new(registry, notifier.clone(), config.codec);
        let pipeline = build_message_pipeline(handler, Arc::clone(&receiver), &config);
        Self {
            inner: Arc::new(ProcessorInner {
                receiver,
                pipeline,
                notifier,
                lifecycle: Arc::new(LifecycleController::new()),
                config,
            }),
        }
    }

    /// Shared lifecycle handle; `trigger_shutdown` on it stops `run`.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.inner.lifecycle)
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Run one delivery attempt end to end: pipeline, settlement, controller
    /// notification. The message is settled exactly once whatever happened.
    pub async fn process_one(&self, message: ReceivedMessage) -> Disposition {
        let delivery = Delivery::new(message.clone());
        let ctx = delivery.ctx.clone();

        let disposition = self
            .inner
            .pipeline
            .clone()
            .oneshot(delivery)
            .await
            .unwrap_or_else(|never| match never {});

        if let Err(error) = self.inner.receiver.complete_message(&message).await {
            error!(
                message_id = %message.message_id,
                error = %error,
                "failed to settle message, it will be redelivered"
            );
            metrics::counter!("opbus_settlement_failures_total").increment(1);
        }

        if let (Some(status), Some(operation_id)) =
            (disposition.controller_status(), disposition.operation_id())
        {
            if !operation_id.is_empty() {
                self.inner.notifier.notify(&ctx, status, operation_id).await;
            }
        }

        disposition
    }

    /// Receive and dispatch until the receiver closes or shutdown is triggered,
    /// then drain in-flight messages.
    ///
    /// At most `max_concurrency` messages are in flight; a permit is taken
    /// before each receive, so with one permit messages settle in receive order.
    ///
    /// # Errors
    ///
    /// Returns the last receive error after `start_max_attempts` consecutive
    /// receive failures.
    pub async fn run(&self) -> anyhow::Result<()> {
        let lifecycle = Arc::clone(&self.inner.lifecycle);
        let config = &self.inner.config;
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut failures = 0u32;

        lifecycle.set_running();
        info!(
            max_concurrency = config.max_concurrency,
            codec = ?config.codec,
            "processor started"
        );

        let outcome = loop {
            reap_finished(&mut tasks);

            let permit = tokio::select! {
                biased;
                () = lifecycle.wait_for_shutdown() => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => permit?,
            };

            let received = tokio::select! {
                biased;
                () = lifecycle.wait_for_shutdown() => break Ok(()),
                received = self.inner.receiver.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    failures = 0;
                    let processor = self.clone();
                    let in_flight = lifecycle.in_flight_guard();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let _in_flight = in_flight;
                        processor.process_one(message).await;
                    });
                }
                Ok(None) => {
                    info!("message source closed");
                    break Ok(());
                }
                Err(error) => {
                    failures += 1;
                    if failures >= config.start_max_attempts {
                        break Err(error.context(format!(
                            "receive failed {failures} consecutive times"
                        )));
                    }
                    let backoff = jittered(config.receive_backoff(failures));
                    warn!(
                        error = %error,
                        attempt = failures,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "receive failed, backing off"
                    );
                    tokio::select! {
                        () = lifecycle.wait_for_shutdown() => break Ok(()),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        };

        if lifecycle.wait_for_drain(config.drain_timeout).await {
            info!("processor drained");
        } else {
            warn!(
                in_flight = lifecycle.in_flight_count(),
                "drain timed out, aborting in-flight messages"
            );
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}

        outcome
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(error) = joined {
            if error.is_panic() {
                error!("message task panicked outside the pipeline boundaries");
            }
        }
    }
}

/// Scale `backoff` by a random factor in `[0.5, 1.0]`.
fn jittered(backoff: Duration) -> Duration {
    backoff.mul_f64(rand::rng().random_range(0.5..=1.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
