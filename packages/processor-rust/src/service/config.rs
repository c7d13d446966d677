use std::time::Duration;

use opbus_core::WireCodec;

/// Processor-level configuration for the message pipeline.
///
/// Controls consumer concurrency, lock renewal, receive retry backoff, and the
/// bound on controller notifications.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Messages processed concurrently. 1 settles strictly in receive order.
    pub max_concurrency: usize,
    /// Interval between transport lock renewals while a message is in flight.
    pub lock_renewal_interval: Duration,
    /// Consecutive receive failures tolerated before `run` gives up.
    pub start_max_attempts: u32,
    /// First backoff after a receive failure; doubles per consecutive failure.
    pub receive_backoff_base: Duration,
    /// Cap on the receive backoff.
    pub receive_backoff_max: Duration,
    /// Upper bound on a single controller notification.
    pub controller_timeout: Duration,
    /// How long `run` waits for in-flight messages after shutdown.
    pub drain_timeout: Duration,
    /// Serialization format of message bodies.
    pub codec: WireCodec,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            lock_renewal_interval: Duration::from_secs(10),
            start_max_attempts: 5,
            receive_backoff_base: Duration::from_secs(1),
            receive_backoff_max: Duration::from_secs(30),
            controller_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            codec: WireCodec::Json,
        }
    }
}

impl ProcessorConfig {
    /// Backoff before the next receive after `failures` consecutive failures
    /// (1-based): `min(base * 2^(failures-1), max)`.
    #[must_use]
    pub fn receive_backoff(&self, failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(failures.saturating_sub(1));
        self.receive_backoff_base
            .saturating_mul(multiplier)
            .min(self.receive_backoff_max)
    }
}
