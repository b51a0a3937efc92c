//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: every worker thread holds the same configuration and counters
//! - **Immutability**: configuration never changes after startup, so `Arc<AppConfig>`
//!   needs no lock at all
//!
//! ### Atomics instead of RwLock
//! - Session counters are plain `AtomicU64`s. Incrementing one never blocks a
//!   session, and reading them for `/health` never waits on a writer.
//!
//! ### RAII permits
//! - [`SessionPermit`] holds one slot of the concurrent session cap. Dropping it
//!   gives the slot back, so a session that ends any way at all (including a
//!   panic in its task) cannot leak capacity.
//!
//! ### watch channel for shutdown
//! - One `watch::Sender<bool>` is shared by all workers. Each session holds a
//!   receiver and drains itself once the value turns `true`.

use crate::config::AppConfig;
use crate::relay::upstream::UpstreamConnector;
use crate::relay::TeardownReason;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// The main application state that's shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Read-only after startup
    pub config: Arc<AppConfig>,

    /// Opens provider connections for new sessions
    pub connector: Arc<dyn UpstreamConnector>,

    pub metrics: Arc<RelayMetrics>,

    /// Set to `true` once the process starts shutting down
    pub shutdown: Arc<watch::Sender<bool>>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, connector: Arc<dyn UpstreamConnector>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            connector,
            metrics: Arc::new(RelayMetrics::default()),
            shutdown: Arc::new(shutdown),
            start_time: Instant::now(),
        }
    }

    /// Tell every running session to drain. Later subscribers see it too.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Process-wide session counters.
///
/// ## Counter Semantics:
/// - **active**: sessions currently holding a permit
/// - **started**: sessions whose socket actor started
/// - **completed**: sessions ended by the browser or by server shutdown
/// - **failed**: sessions that ended for any other reason
#[derive(Debug, Default)]
pub struct RelayMetrics {
    active: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`] for serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
}

impl RelayMetrics {
    /// Reserve a session slot, or `None` when `max` sessions are already active.
    pub fn try_admit(self: &Arc<Self>, max: usize) -> Option<SessionPermit> {
        let max = max as u64;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max).then_some(active + 1)
            })
            .ok()?;

        Some(SessionPermit {
            metrics: Arc::clone(self),
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active: self.active.load(Ordering::SeqCst),
            started: self.started.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// One slot of the concurrent session cap.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RelayMetrics>,
}

impl SessionPermit {
    pub fn record_started(&self) {
        self.metrics.started.fetch_add(1, Ordering::SeqCst);
    }

    /// Record how the session ended and release the slot.
    pub fn finish(self, reason: &TeardownReason) {
        let counter = if reason.is_failure() {
            &self.metrics.failed
        } else {
            &self.metrics.completed
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::SeqCst);
    }
}
