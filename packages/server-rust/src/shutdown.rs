//! Drain coordination shared by the RPC server and the HTTP façade.
//!
//! Health state lives in an `ArcSwap` so probes read it without locking.
//! In-flight work is counted with RAII guards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Lifecycle of the responder, as reported to readiness probes.
///
/// Transitions: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Queue not yet subscribed.
    Starting,
    /// Consuming requests.
    Ready,
    /// No longer pulling requests; finishing in-flight handlers.
    Draining,
    /// Every handler has finished or been aborted.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Tracks health and in-flight handlers for one responder.
#[derive(Debug)]
pub struct ShutdownController {
    in_flight: Arc<AtomicU64>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Moves to `Draining`, which fails readiness probes.
    pub fn trigger_shutdown(&self) {
        self.health_state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Marks the controller stopped regardless of remaining in-flight work.
    /// Used after stragglers have been aborted.
    pub fn mark_stopped(&self) {
        self.health_state.store(Arc::new(HealthState::Stopped));
    }

    /// Counts one in-flight handler until the guard drops (panics included).
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no handler is in flight, or `grace` elapses.
    ///
    /// Returns `true` and moves to `Stopped` on a clean drain; returns
    /// `false` with the state left at `Draining` otherwise.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            if self.in_flight_count() == 0 {
                self.mark_stopped();
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
