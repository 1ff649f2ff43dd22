//! Public types for the cart engine.

use serde::Serialize;

use crate::write_behind::WriteBehindSnapshot;

/// Engine lifecycle state.
///
/// Use [`super::CartEngine::state()`] to check the current state or
/// [`super::CartEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to backends
    Connecting,
    /// Stores wired, accepting requests
    Ready,
    /// Run loop active (scheduled scans running)
    Running,
    /// Draining write-behind
    ShuttingDown,
    /// Write-behind stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Write-behind part of a [`HealthCheck`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteBehindHealth {
    pub depth: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_converted: u64,
}

impl WriteBehindHealth {
    pub(super) fn new(depth: usize, stats: WriteBehindSnapshot) -> Self {
        Self {
            depth,
            enqueued: stats.enqueued,
            dropped: stats.dropped,
            succeeded: stats.succeeded,
            failed: stats.failed,
            skipped_converted: stats.skipped_converted,
        }
    }
}

/// Snapshot for `/ready` and `/health` endpoints.
///
/// Backend fields are `None` when that backend is not configured (the
/// in-memory tier is in use).
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    pub ready: bool,
    pub redis_connected: Option<bool>,
    pub redis_latency_ms: Option<u64>,
    pub sql_connected: Option<bool>,
    pub sql_latency_ms: Option<u64>,
    pub write_behind: WriteBehindHealth,
    pub healthy: bool,
}
