//! Engine lifecycle management: start, run loop, scheduled scans, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval_at, Interval};
use tracing::{error, info, warn};

use crate::abandonment::{AbandonedCartSink, AbandonmentDetector};
use crate::config::CartEngineConfig;
use crate::conversion::ConversionTracker;
use crate::coordinator::{CoordinatorSettings, SyncCoordinator};
use crate::error::CartError;
use crate::retention::RetentionSweeper;
use crate::storage::memory::{InMemoryDurableStore, InMemoryEphemeralStore, InMemorySavedCartStore};
use crate::storage::redis::RedisCartStore;
use crate::storage::sql::SqlCartStore;
use crate::storage::traits::{DurableCartStore, EphemeralCartStore, SavedCartStore};

use super::{CartEngine, Components, EngineState};

/// Interval whose first tick is one period from now.
fn delayed_interval(period: Duration) -> Interval {
    interval_at(tokio::time::Instant::now() + period, period)
}

impl CartEngine {
    /// Connect backends and wire components.
    ///
    /// Startup order:
    /// 1. SQL (durable + saved tiers). A configured but unreachable SQL
    ///    backend fails startup; no URL means in-memory tiers.
    /// 2. Redis (ephemeral tier). Unreachable Redis falls back to the
    ///    in-memory tier with a warning; recovery covers the gap.
    /// 3. Spawn the write-behind worker. Ready.
    #[tracing::instrument(skip(self), fields(has_redis, has_sql))]
    pub async fn start(&mut self) -> Result<(), CartError> {
        if self.components.is_some() {
            return Ok(());
        }

        let startup_start = Instant::now();
        info!("Starting cart engine...");
        self.set_state(EngineState::Connecting);
        let config = self.config.read().clone();

        let (ephemeral, durable, saved) = match self.provided.take() {
            Some(provided) => {
                info!("Using caller-provided stores");
                (provided.ephemeral, provided.durable, provided.saved)
            }
            None => {
                let (durable, saved) = match self.connect_sql(&config).await {
                    Ok(stores) => stores,
                    Err(e) => {
                        self.set_state(EngineState::Created);
                        return Err(e);
                    }
                };
                let ephemeral = self.connect_redis(&config).await;
                (ephemeral, durable, saved)
            }
        };

        let phase_start = Instant::now();
        let coordinator = Arc::new(SyncCoordinator::new(
            ephemeral.clone(),
            durable.clone(),
            saved,
            CoordinatorSettings::from_config(&config),
            config.write_behind_capacity,
        ));
        let conversions =
            Arc::new(ConversionTracker::new(durable.clone(), ephemeral).with_write_behind(coordinator.write_behind()));
        self.components = Some(Components {
            coordinator,
            conversions,
            abandonment: Arc::new(AbandonmentDetector::new(durable.clone(), config.abandonment_threshold())),
            retention: Arc::new(RetentionSweeper::new(durable.clone(), config.retention())),
            durable,
        });
        crate::metrics::record_startup_phase("wire", phase_start.elapsed());

        self.set_state(EngineState::Ready);
        crate::metrics::record_startup_total(startup_start.elapsed());
        info!("Cart engine ready");
        Ok(())
    }

    async fn connect_sql(
        &mut self,
        config: &CartEngineConfig,
    ) -> Result<(Arc<dyn DurableCartStore>, Arc<dyn SavedCartStore>), CartError> {
        let phase_start = Instant::now();
        let Some(ref sql_url) = config.sql_url else {
            warn!("No SQL URL configured - durable tier is in-memory and will not survive restarts");
            tracing::Span::current().record("has_sql", false);
            let durable: Arc<dyn DurableCartStore> = Arc::new(InMemoryDurableStore::new());
            let saved: Arc<dyn SavedCartStore> = Arc::new(InMemorySavedCartStore::new());
            return Ok((durable, saved));
        };

        info!("Connecting to SQL (durable tier)...");
        match SqlCartStore::new(sql_url).await {
            Ok(store) => {
                let store = Arc::new(store);
                self.sql_store = Some(store.clone());
                tracing::Span::current().record("has_sql", true);
                crate::metrics::set_backend_healthy("sql", true);
                crate::metrics::record_startup_phase("sql_connect", phase_start.elapsed());
                info!("SQL connected");
                let durable: Arc<dyn DurableCartStore> = store.clone();
                let saved: Arc<dyn SavedCartStore> = store;
                Ok((durable, saved))
            }
            Err(e) => {
                tracing::Span::current().record("has_sql", false);
                error!(error = %e, "Failed to connect to SQL - required when configured");
                crate::metrics::set_backend_healthy("sql", false);
                crate::metrics::record_connection_error("sql");
                Err(e.into())
            }
        }
    }

    async fn connect_redis(&mut self, config: &CartEngineConfig) -> Arc<dyn EphemeralCartStore> {
        let phase_start = Instant::now();
        let Some(ref redis_url) = config.redis_url else {
            tracing::Span::current().record("has_redis", false);
            return Arc::new(InMemoryEphemeralStore::new());
        };

        info!(prefix = ?config.redis_prefix, "Connecting to Redis (ephemeral tier)...");
        match RedisCartStore::with_prefix(redis_url, config.redis_prefix.as_deref()).await {
            Ok(store) => {
                let store = Arc::new(store);
                self.redis_store = Some(store.clone());
                tracing::Span::current().record("has_redis", true);
                crate::metrics::set_backend_healthy("redis", true);
                crate::metrics::record_startup_phase("redis_connect", phase_start.elapsed());
                info!("Redis connected");
                store
            }
            Err(e) => {
                tracing::Span::current().record("has_redis", false);
                warn!(error = %e, "Failed to connect to Redis, continuing with in-memory ephemeral tier");
                crate::metrics::set_backend_healthy("redis", false);
                crate::metrics::record_connection_error("redis");
                Arc::new(InMemoryEphemeralStore::new())
            }
        }
    }

    /// Run the abandonment scan across every tenant. Returns carts delivered.
    pub async fn run_abandonment_scan(&self, sink: &dyn AbandonedCartSink) -> Result<usize, CartError> {
        let components = self.components()?;
        let tenants = components.durable.tenant_ids().await?;

        let mut delivered = 0;
        for tenant_id in &tenants {
            match components.abandonment.notify_abandoned(tenant_id, sink).await {
                Ok(n) => delivered += n,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Abandonment scan failed for tenant");
                    crate::metrics::record_error("durable", "abandonment_scan", "query");
                }
            }
        }
        Ok(delivered)
    }

    /// Run the retention sweep across every tenant. Returns records deleted.
    pub async fn run_retention_sweep(&self) -> Result<u64, CartError> {
        let components = self.components()?;
        let tenants = components.durable.tenant_ids().await?;

        let mut deleted = 0;
        for tenant_id in &tenants {
            match components.retention.cleanup(tenant_id).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Retention sweep failed for tenant");
                    crate::metrics::record_error("durable", "retention_sweep", "delete");
                }
            }
        }
        Ok(deleted)
    }

    /// Push new thresholds into the running components.
    fn apply_config(&self, new_config: CartEngineConfig) {
        if let Some(ref components) = self.components {
            components
                .coordinator
                .update_settings(CoordinatorSettings::from_config(&new_config));
            components.abandonment.set_threshold(new_config.abandonment_threshold());
            components.retention.set_retention(new_config.retention());
        }
        info!(
            abandonment_threshold_secs = new_config.abandonment_threshold_secs,
            retention_days = new_config.retention_days,
            "Config updated"
        );
        *self.config.write() = new_config;
    }

    /// Run scheduled scans until shutdown.
    #[tracing::instrument(skip(self, sink))]
    pub async fn run(&self, sink: Arc<dyn AbandonedCartSink>) {
        if let Err(e) = self.components() {
            warn!(error = %e, "Run loop not started");
            return;
        }
        self.set_state(EngineState::Running);
        info!("Cart engine running");

        let config = self.config();
        let mut abandonment_period = config.abandonment_scan_interval();
        let mut retention_period = config.retention_scan_interval();
        let mut abandonment_interval = delayed_interval(abandonment_period);
        let mut retention_interval = delayed_interval(retention_period);

        let mut config_rx = self.config_rx.lock().await;
        let mut state_rx = self.state_rx.clone();
        state_rx.borrow_and_update();

        loop {
            tokio::select! {
                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    if new_config.abandonment_scan_interval() != abandonment_period {
                        abandonment_period = new_config.abandonment_scan_interval();
                        abandonment_interval = delayed_interval(abandonment_period);
                    }
                    if new_config.retention_scan_interval() != retention_period {
                        retention_period = new_config.retention_scan_interval();
                        retention_interval = delayed_interval(retention_period);
                    }
                    self.apply_config(new_config);
                }

                _ = abandonment_interval.tick() => {
                    let start = Instant::now();
                    match self.run_abandonment_scan(sink.as_ref()).await {
                        Ok(delivered) => info!(delivered, "Abandonment scan complete"),
                        Err(e) => {
                            warn!(error = %e, "Abandonment scan failed, will retry next tick");
                            crate::metrics::record_scan("abandonment_all", start.elapsed(), false);
                        }
                    }
                }

                _ = retention_interval.tick() => {
                    match self.run_retention_sweep().await {
                        Ok(deleted) => info!(deleted, "Retention sweep complete"),
                        Err(e) => warn!(error = %e, "Retention sweep failed, will retry next tick"),
                    }
                }

                Ok(()) = state_rx.changed() => {
                    let state = *state_rx.borrow_and_update();
                    if matches!(state, EngineState::ShuttingDown | EngineState::Stopped) {
                        info!(%state, "Run loop exiting");
                        break;
                    }
                }
            }
        }
    }

    /// Graceful shutdown: stop accepting work and drain write-behind.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating cart engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        if let Some(ref components) = self.components {
            components.coordinator.shutdown().await;
        }

        self.set_state(EngineState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Cart engine shutdown complete");
    }
}
