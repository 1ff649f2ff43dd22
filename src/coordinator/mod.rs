// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cart sync coordinator.
//!
//! The [`SyncCoordinator`] keeps the two cart tiers consistent:
//! - writes go to the ephemeral tier synchronously and to the durable tier
//!   through the write-behind queue
//! - reads fall back from the ephemeral tier to durable recovery
//! - sign-in merges the guest cart into the user's cart
//! - saved-for-later lists move items in and out of the cart
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use cart_engine::{CartItem, CoordinatorSettings, SyncCoordinator};
//! use cart_engine::storage::memory::{InMemoryDurableStore, InMemoryEphemeralStore, InMemorySavedCartStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let coordinator = SyncCoordinator::new(
//!     Arc::new(InMemoryEphemeralStore::new()),
//!     Arc::new(InMemoryDurableStore::new()),
//!     Arc::new(InMemorySavedCartStore::new()),
//!     CoordinatorSettings::default(),
//!     1024,
//! );
//!
//! let mut cart = coordinator.new_cart("tenant-a", "sess-1").await;
//! cart.push_item(CartItem::new("line-1", "prod-1", "SKU-1", "Mug", 1, 1250).unwrap());
//! let cart = coordinator.persist(cart).await;
//!
//! let loaded = coordinator.load("tenant-a", "sess-1").await.unwrap();
//! assert_eq!(loaded.items, cart.items);
//! # coordinator.shutdown().await;
//! # }
//! ```

mod identity;
mod saved;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cart::{duration_millis, now_millis, Cart, PersistedCart};
use crate::config::CartEngineConfig;
use crate::storage::traits::{DurableCartStore, EphemeralCartStore, SavedCartStore};
use crate::write_behind::{WriteBehindQueue, WriteBehindSnapshot};

/// Time windows the coordinator applies to carts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// TTL for carts created through [`SyncCoordinator::new_cart`]
    pub cart_ttl: Duration,
    /// New lifetime given to a recovered or re-seeded cart
    pub recovery_window: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&CartEngineConfig::default())
    }
}

impl CoordinatorSettings {
    #[must_use]
    pub fn from_config(config: &CartEngineConfig) -> Self {
        Self {
            cart_ttl: config.cart_ttl(),
            recovery_window: config.recovery_window(),
        }
    }
}

pub struct SyncCoordinator {
    pub(crate) ephemeral: Arc<dyn EphemeralCartStore>,
    pub(crate) durable: Arc<dyn DurableCartStore>,
    pub(crate) saved: Arc<dyn SavedCartStore>,
    write_behind: Arc<WriteBehindQueue>,
    settings: RwLock<CoordinatorSettings>,
}

impl SyncCoordinator {
    /// Wire the stores and spawn the write-behind worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        ephemeral: Arc<dyn EphemeralCartStore>,
        durable: Arc<dyn DurableCartStore>,
        saved: Arc<dyn SavedCartStore>,
        settings: CoordinatorSettings,
        write_behind_capacity: usize,
    ) -> Self {
        let write_behind = Arc::new(WriteBehindQueue::spawn(durable.clone(), write_behind_capacity));
        Self {
            ephemeral,
            durable,
            saved,
            write_behind,
            settings: RwLock::new(settings),
        }
    }

    #[must_use]
    pub fn settings(&self) -> CoordinatorSettings {
        *self.settings.read()
    }

    pub fn update_settings(&self, settings: CoordinatorSettings) {
        *self.settings.write() = settings;
    }

    /// An empty cart for a session, using the configured TTL. Not stored until persisted.
    ///
    /// The cart id is the session id unless a converted cart already holds
    /// it. After a checkout the session's next cart takes the first free
    /// `{session_id}.{n}`, so it gets its own durable record.
    #[tracing::instrument(skip(self))]
    pub async fn new_cart(&self, tenant_id: &str, session_id: &str) -> Cart {
        let mut cart = Cart::new(tenant_id, session_id, self.settings().cart_ttl);
        let mut checkouts = 0u32;

        loop {
            match self.durable.find_by_id(tenant_id, &cart.id).await {
                Ok(Some(record)) if record.converted => {
                    checkouts += 1;
                    cart.id = format!("{session_id}.{checkouts}");
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, cart_id = %cart.id, "Durable lookup failed, keeping cart id unchecked");
                    crate::metrics::record_error("durable", "new_cart", "lookup");
                    break;
                }
            }
        }

        if checkouts > 0 {
            debug!(cart_id = %cart.id, "Session already checked out, new cart gets its own id");
        }
        cart
    }

    /// Write a cart to the ephemeral tier and queue durable replication.
    ///
    /// Never fails: storage problems are logged and counted. The returned
    /// cart carries the new `updated_at`.
    #[tracing::instrument(skip(self, cart), fields(tenant_id = %cart.tenant_id, cart_id = %cart.id))]
    pub async fn persist(&self, mut cart: Cart) -> Cart {
        let start = Instant::now();
        let now = now_millis();
        cart.updated_at = now;

        match self.ephemeral.set(&cart, cart.ttl_from(now)).await {
            Ok(()) => {
                crate::metrics::record_operation("ephemeral", "set", "success");
                crate::metrics::record_latency("ephemeral", "set", start.elapsed());
            }
            Err(e) => {
                warn!(error = %e, "Ephemeral write failed, relying on write-behind");
                crate::metrics::record_operation("ephemeral", "set", "error");
            }
        }

        self.write_behind.enqueue(cart.clone());
        cart
    }

    /// Current cart for a session: ephemeral hit, else durable recovery.
    #[tracing::instrument(skip(self), fields(tier))]
    pub async fn load(&self, tenant_id: &str, session_id: &str) -> Option<Cart> {
        let start = Instant::now();

        match self.ephemeral.get(tenant_id, session_id).await {
            Ok(Some(cart)) => {
                tracing::Span::current().record("tier", "ephemeral");
                crate::metrics::record_operation("ephemeral", "get", "hit");
                crate::metrics::record_latency("ephemeral", "get", start.elapsed());
                return Some(cart);
            }
            Ok(None) => {
                debug!("Ephemeral miss");
                crate::metrics::record_operation("ephemeral", "get", "miss");
            }
            Err(e) => {
                warn!(error = %e, "Ephemeral lookup failed, trying durable tier");
                crate::metrics::record_operation("ephemeral", "get", "error");
            }
        }

        tracing::Span::current().record("tier", "durable");
        self.recover(tenant_id, session_id).await
    }

    /// Rebuild the ephemeral entry from the durable tier.
    ///
    /// Converted records are never recovered. The recovered cart's
    /// `expires_at` moves to `now + recovery_window`. A durable failure
    /// reads as "no cart".
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self, tenant_id: &str, session_id: &str) -> Option<Cart> {
        let start = Instant::now();

        let record = match self.durable.find_by_session(tenant_id, session_id).await {
            Ok(Some(record)) if record.converted => {
                debug!(cart_id = %record.id, "Latest cart for session is converted, not recovering");
                crate::metrics::record_recovery("converted");
                return None;
            }
            Ok(Some(record)) => record,
            Ok(None) => {
                crate::metrics::record_recovery("miss");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Durable lookup failed during recovery");
                crate::metrics::record_recovery("error");
                crate::metrics::record_error("durable", "recover", "lookup");
                return None;
            }
        };

        let cart = self.reseed(record.cart).await;
        crate::metrics::record_recovery("recovered");
        crate::metrics::record_latency("durable", "recover", start.elapsed());
        info!(cart_id = %cart.id, items = cart.items.len(), "Cart recovered from durable tier");
        Some(cart)
    }

    /// Extend a cart's lifetime and write it back to the ephemeral tier (best-effort).
    async fn reseed(&self, mut cart: Cart) -> Cart {
        let now = now_millis();
        let window = duration_millis(self.settings().recovery_window);
        cart.expires_at = cart.expires_at.max(now.saturating_add(window));

        if let Err(e) = self.ephemeral.set(&cart, cart.ttl_from(now)).await {
            warn!(cart_id = %cart.id, error = %e, "Failed to reseed ephemeral tier");
            crate::metrics::record_operation("ephemeral", "set", "error");
        } else {
            crate::metrics::record_operation("ephemeral", "set", "success");
        }
        cart
    }

    /// Non-converted durable record currently owned by the session.
    async fn session_record(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<PersistedCart>, crate::storage::traits::StorageError> {
        Ok(self
            .durable
            .find_by_session(tenant_id, session_id)
            .await?
            .filter(|r| !r.converted))
    }

    /// Wait for all queued durable replication to finish.
    pub async fn flush(&self) {
        self.write_behind.flush().await;
    }

    /// Drain the write-behind queue and stop its worker.
    pub async fn shutdown(&self) {
        self.write_behind.shutdown().await;
    }

    /// Shared handle to the write-behind queue, for components that must
    /// observe replicated state (conversion).
    #[must_use]
    pub fn write_behind(&self) -> Arc<WriteBehindQueue> {
        self.write_behind.clone()
    }

    #[must_use]
    pub fn write_behind_stats(&self) -> WriteBehindSnapshot {
        self.write_behind.stats()
    }

    #[must_use]
    pub fn write_behind_depth(&self) -> usize {
        self.write_behind.depth()
    }
}
