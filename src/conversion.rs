//! Cart → order conversion.
//!
//! Marking a cart converted is terminal: recovery and abandonment scans skip
//! it, write-behind stops touching it, and only the retention sweep removes
//! it. The first order id recorded wins.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cart::{now_millis, Cart, PersistedCart};
use crate::error::CartError;
use crate::storage::traits::{DurableCartStore, EphemeralCartStore};
use crate::write_behind::WriteBehindQueue;

/// Result of [`ConversionTracker::mark_converted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// This call converted the cart
    Converted,
    /// The cart was already converted; carries the order id that won
    AlreadyConverted { order_id: String },
    /// Neither a durable record nor a live cart with that id
    NotFound,
}

pub struct ConversionTracker {
    durable: Arc<dyn DurableCartStore>,
    ephemeral: Arc<dyn EphemeralCartStore>,
    write_behind: Option<Arc<WriteBehindQueue>>,
}

impl ConversionTracker {
    pub fn new(durable: Arc<dyn DurableCartStore>, ephemeral: Arc<dyn EphemeralCartStore>) -> Self {
        Self {
            durable,
            ephemeral,
            write_behind: None,
        }
    }

    /// Drain this queue before every conversion so no queued snapshot lands
    /// after the cart is marked.
    #[must_use]
    pub fn with_write_behind(mut self, queue: Arc<WriteBehindQueue>) -> Self {
        self.write_behind = Some(queue);
        self
    }

    /// Record that `cart_id` became `order_id`. Idempotent.
    ///
    /// The live ephemeral copy, when present, is the snapshot that gets
    /// frozen: it covers a write-behind that was dropped or failed. The
    /// ephemeral entry is evicted on every path that finds the cart.
    #[tracing::instrument(skip(self))]
    pub async fn mark_converted(
        &self,
        tenant_id: &str,
        cart_id: &str,
        order_id: &str,
    ) -> Result<ConversionOutcome, CartError> {
        let _timer = crate::metrics::LatencyTimer::new("durable", "mark_converted");
        if let Some(queue) = &self.write_behind {
            queue.flush().await;
        }

        let existing = self.durable.find_by_id(tenant_id, cart_id).await?;
        let session_id = existing
            .as_ref()
            .map_or(cart_id, |r| r.session_id.as_str())
            .to_string();

        if let Some(record) = existing.as_ref().filter(|r| r.converted) {
            self.evict(tenant_id, &session_id, cart_id).await;
            crate::metrics::record_conversion("already_converted");
            return Ok(ConversionOutcome::AlreadyConverted {
                order_id: record.order_id.clone().unwrap_or_default(),
            });
        }

        let live = self.live_cart(tenant_id, &session_id, cart_id).await;
        let now = now_millis();
        let mut record = match (existing, live) {
            (Some(mut record), Some(cart)) => {
                record.sync_from(cart, now);
                record
            }
            (Some(record), None) => record,
            (None, Some(cart)) => {
                debug!("No durable record yet, converting the live cart");
                PersistedCart::from_cart(cart, now)
            }
            (None, None) => {
                debug!("No cart to convert");
                crate::metrics::record_conversion("not_found");
                return Ok(ConversionOutcome::NotFound);
            }
        };

        record.converted = true;
        record.order_id = Some(order_id.to_string());
        record.updated_at = now;
        self.durable.save(&record).await?;
        self.evict(tenant_id, &record.session_id, cart_id).await;

        // A concurrent conversion may have landed first; the store keeps its order id.
        if let Some(stored) = self.durable.find_by_id(tenant_id, cart_id).await? {
            if let Some(winner) = stored.order_id.filter(|id| id != order_id) {
                crate::metrics::record_conversion("already_converted");
                return Ok(ConversionOutcome::AlreadyConverted { order_id: winner });
            }
        }

        crate::metrics::record_conversion("converted");
        info!(session_id = %record.session_id, "Cart converted");
        Ok(ConversionOutcome::Converted)
    }

    /// The session's ephemeral cart, if it is the cart being converted.
    async fn live_cart(&self, tenant_id: &str, session_id: &str, cart_id: &str) -> Option<Cart> {
        match self.ephemeral.get(tenant_id, session_id).await {
            Ok(cart) => cart.filter(|c| c.id == cart_id),
            Err(e) => {
                warn!(session_id, error = %e, "Ephemeral lookup failed during conversion");
                crate::metrics::record_operation("ephemeral", "get", "error");
                None
            }
        }
    }

    /// Drop the ephemeral entry unless the session has already moved on to another cart.
    async fn evict(&self, tenant_id: &str, session_id: &str, cart_id: &str) {
        if self.live_cart(tenant_id, session_id, cart_id).await.is_none() {
            return;
        }
        if let Err(e) = self.ephemeral.delete(tenant_id, session_id).await {
            warn!(session_id, error = %e, "Failed to evict converted cart from ephemeral tier");
            crate::metrics::record_operation("ephemeral", "delete", "error");
        }
    }
}
