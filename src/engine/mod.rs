// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cart engine: lifecycle owner for the cart tiers.
//!
//! The [`CartEngine`] connects the configured backends, wires the
//! [`SyncCoordinator`], [`ConversionTracker`], [`AbandonmentDetector`] and
//! [`RetentionSweeper`] to them, runs the scheduled scans, and drains the
//! write-behind queue on shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use cart_engine::{CartEngine, CartEngineConfig, EngineState};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CartEngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let mut engine = CartEngine::new(config, rx);
//!
//! assert_eq!(engine.state(), EngineState::Created);
//! engine.start().await.expect("Start failed");
//! assert!(engine.is_ready());
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{EngineState, HealthCheck, WriteBehindHealth};

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};

use crate::abandonment::AbandonmentDetector;
use crate::config::CartEngineConfig;
use crate::conversion::ConversionTracker;
use crate::coordinator::SyncCoordinator;
use crate::error::CartError;
use crate::retention::RetentionSweeper;
use crate::storage::redis::RedisCartStore;
use crate::storage::sql::SqlCartStore;
use crate::storage::traits::{DurableCartStore, EphemeralCartStore, SavedCartStore};

/// Caller-supplied stores for [`CartEngine::with_stores`].
pub(super) struct ProvidedStores {
    ephemeral: Arc<dyn EphemeralCartStore>,
    durable: Arc<dyn DurableCartStore>,
    saved: Arc<dyn SavedCartStore>,
}

/// Components wired at start.
pub(super) struct Components {
    coordinator: Arc<SyncCoordinator>,
    conversions: Arc<ConversionTracker>,
    abandonment: Arc<AbandonmentDetector>,
    retention: Arc<RetentionSweeper>,
    durable: Arc<dyn DurableCartStore>,
}

pub struct CartEngine {
    /// Configuration (can be updated at runtime via watch channel)
    pub(super) config: RwLock<CartEngineConfig>,

    /// Runtime config updates (Mutex so run() can take &self)
    pub(super) config_rx: Mutex<watch::Receiver<CartEngineConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) provided: Option<ProvidedStores>,
    pub(super) components: Option<Components>,

    /// Direct backend handles for health probes
    pub(super) redis_store: Option<Arc<RedisCartStore>>,
    pub(super) sql_store: Option<Arc<SqlCartStore>>,
}

impl CartEngine {
    /// Create an engine that connects to the backends named in `config`.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to connect and transition to `Ready`.
    pub fn new(config: CartEngineConfig, config_rx: watch::Receiver<CartEngineConfig>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            provided: None,
            components: None,
            redis_store: None,
            sql_store: None,
        }
    }

    /// Create an engine over caller-provided stores. Backend URLs in
    /// `config` are ignored.
    pub fn with_stores(
        config: CartEngineConfig,
        config_rx: watch::Receiver<CartEngineConfig>,
        ephemeral: Arc<dyn EphemeralCartStore>,
        durable: Arc<dyn DurableCartStore>,
        saved: Arc<dyn SavedCartStore>,
    ) -> Self {
        let mut engine = Self::new(config, config_rx);
        engine.provided = Some(ProvidedStores {
            ephemeral,
            durable,
            saved,
        });
        engine
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    #[must_use]
    pub fn config(&self) -> CartEngineConfig {
        self.config.read().clone()
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    fn components(&self) -> Result<&Components, CartError> {
        match self.state() {
            EngineState::ShuttingDown | EngineState::Stopped => Err(CartError::ShuttingDown),
            _ => self.components.as_ref().ok_or(CartError::NotStarted),
        }
    }

    pub fn coordinator(&self) -> Result<Arc<SyncCoordinator>, CartError> {
        Ok(self.components()?.coordinator.clone())
    }

    pub fn conversions(&self) -> Result<Arc<ConversionTracker>, CartError> {
        Ok(self.components()?.conversions.clone())
    }

    pub fn abandonment(&self) -> Result<Arc<AbandonmentDetector>, CartError> {
        Ok(self.components()?.abandonment.clone())
    }

    pub fn retention(&self) -> Result<Arc<RetentionSweeper>, CartError> {
        Ok(self.components()?.retention.clone())
    }

    /// Probe backends and collect write-behind counters.
    ///
    /// Live probes are Redis PING and SQL `SELECT 1`, run in parallel.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = matches!(state, EngineState::Ready | EngineState::Running);

        let write_behind = self
            .components
            .as_ref()
            .map(|c| WriteBehindHealth::new(c.coordinator.write_behind_depth(), c.coordinator.write_behind_stats()))
            .unwrap_or_default();

        let (redis_result, sql_result) = tokio::join!(self.probe_redis(), self.probe_sql());
        let (redis_connected, redis_latency_ms) = redis_result;
        let (sql_connected, sql_latency_ms) = sql_result;

        let healthy = ready && redis_connected != Some(false) && sql_connected != Some(false);

        HealthCheck {
            state,
            ready,
            redis_connected,
            redis_latency_ms,
            sql_connected,
            sql_latency_ms,
            write_behind,
            healthy,
        }
    }

    async fn probe_redis(&self) -> (Option<bool>, Option<u64>) {
        let Some(ref redis) = self.redis_store else {
            return (None, None);
        };
        let start = Instant::now();
        match EphemeralCartStore::ping(redis.as_ref()).await {
            Ok(()) => {
                crate::metrics::set_backend_healthy("redis", true);
                (Some(true), Some(start.elapsed().as_millis() as u64))
            }
            Err(_) => {
                crate::metrics::set_backend_healthy("redis", false);
                (Some(false), None)
            }
        }
    }

    async fn probe_sql(&self) -> (Option<bool>, Option<u64>) {
        let Some(ref sql) = self.sql_store else {
            return (None, None);
        };
        let start = Instant::now();
        match DurableCartStore::ping(sql.as_ref()).await {
            Ok(()) => {
                crate::metrics::set_backend_healthy("sql", true);
                (Some(true), Some(start.elapsed().as_millis() as u64))
            }
            Err(_) => {
                crate::metrics::set_backend_healthy("sql", false);
                (Some(false), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryEphemeralStore, InMemorySavedCartStore};

    #[test]
    fn test_new_engine_is_created() {
        let config = CartEngineConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        let engine = CartEngine::new(config, rx);
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_ready());
        assert!(matches!(engine.coordinator(), Err(CartError::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_without_urls_uses_memory_tiers() {
        let config = CartEngineConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        let mut engine = CartEngine::new(config, rx);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        let health = engine.health_check().await;
        assert!(health.healthy);
        assert!(health.redis_connected.is_none());
        assert!(health.sql_connected.is_none());

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(engine.coordinator(), Err(CartError::ShuttingDown)));
        assert!(!engine.health_check().await.healthy);
    }

    #[tokio::test]
    async fn test_with_stores_uses_provided_stores() {
        let config = CartEngineConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        let durable = Arc::new(InMemoryDurableStore::new());
        let mut engine = CartEngine::with_stores(
            config,
            rx,
            Arc::new(InMemoryEphemeralStore::new()),
            durable.clone(),
            Arc::new(InMemorySavedCartStore::new()),
        );
        engine.start().await.unwrap();

        let coordinator = engine.coordinator().unwrap();
        let cart = coordinator.new_cart("t1", "s1").await;
        coordinator.persist(cart).await;
        coordinator.flush().await;
        assert_eq!(durable.len(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sqlite_start_reports_sql_health() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
        let config = CartEngineConfig {
            sql_url: Some(url),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(config.clone());
        let mut engine = CartEngine::new(config, rx);
        engine.start().await.unwrap();

        let health = engine.health_check().await;
        assert_eq!(health.sql_connected, Some(true));
        assert!(health.healthy);
        engine.shutdown().await;
    }
}
