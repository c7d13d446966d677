//! Processor lifecycle: state transitions, shutdown signalling, and in-flight
//! message tracking.
//!
//! State lives in an `ArcSwap` so readers never block the receive loop, and
//! in-flight messages are counted with RAII guards so a panicking task still
//! releases its slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Processor state machine: Starting -> Running -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Constructed, receive loop not started yet.
    Starting,
    /// Receiving and dispatching messages.
    Running,
    /// No new receives; waiting for in-flight messages to settle.
    Draining,
    /// All in-flight messages settled.
    Stopped,
}

impl ProcessorState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub struct LifecycleController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<ProcessorState>,
}

impl LifecycleController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(ProcessorState::Starting),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProcessorState {
        **self.state.load()
    }

    /// Moves to `Running` unless shutdown was already triggered.
    pub fn set_running(&self) {
        if !self.is_shutting_down() {
            self.state.store(Arc::new(ProcessorState::Running));
        }
    }

    /// Stop receiving. The receive loop moves to `Draining` on its next turn.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(ProcessorState::Draining));
        // `send` drops the value when no receiver is alive; the flag must stick.
        self.shutdown_signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Resolves once shutdown has been triggered, including before the call.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_signal.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Track one in-flight message until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Wait for in-flight messages to settle, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` when everything settled. On
    /// timeout returns `false` and leaves the state at `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        self.state.store(Arc::new(ProcessorState::Draining));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(ProcessorState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop, unwinding included.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
