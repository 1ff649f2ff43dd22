//! Abandoned-cart detection.
//!
//! A cart is abandoned when it is not converted, still has items, and its
//! durable record was last updated **strictly before** `now - threshold`.
//! Results are handed to an [`AbandonedCartSink`], the seam to whatever
//! delivers reminders (email, push, a marketing queue).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cart::{duration_millis, now_millis, PersistedCart};
use crate::error::CartError;
use crate::storage::traits::DurableCartStore;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification rejected: {0}")]
    Rejected(String),
    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),
}

/// Receives abandoned carts.
#[async_trait]
pub trait AbandonedCartSink: Send + Sync {
    async fn notify(&self, cart: &PersistedCart) -> Result<(), NotifyError>;
}

/// Sink that only logs. Used when no delivery channel is wired.
pub struct TracingSink;

#[async_trait]
impl AbandonedCartSink for TracingSink {
    async fn notify(&self, cart: &PersistedCart) -> Result<(), NotifyError> {
        info!(
            tenant_id = %cart.tenant_id,
            cart_id = %cart.id,
            user_id = ?cart.user_id,
            items = cart.cart.items.len(),
            "Abandoned cart"
        );
        Ok(())
    }
}

pub struct AbandonmentDetector {
    durable: Arc<dyn DurableCartStore>,
    threshold: RwLock<Duration>,
}

impl AbandonmentDetector {
    pub fn new(durable: Arc<dyn DurableCartStore>, threshold: Duration) -> Self {
        Self {
            durable,
            threshold: RwLock::new(threshold),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> Duration {
        *self.threshold.read()
    }

    pub fn set_threshold(&self, threshold: Duration) {
        *self.threshold.write() = threshold;
    }

    /// Abandoned carts for a tenant, oldest first.
    pub async fn find_abandoned(&self, tenant_id: &str) -> Result<Vec<PersistedCart>, CartError> {
        self.find_abandoned_as_of(tenant_id, now_millis()).await
    }

    /// Same as [`find_abandoned`](Self::find_abandoned) with an explicit clock.
    #[tracing::instrument(skip(self))]
    pub async fn find_abandoned_as_of(&self, tenant_id: &str, now: i64) -> Result<Vec<PersistedCart>, CartError> {
        let cutoff = now.saturating_sub(duration_millis(self.threshold()));
        let found: Vec<PersistedCart> = self
            .durable
            .find_abandoned(tenant_id, cutoff)
            .await?
            .into_iter()
            // Stores already filter; converted carts must never leak out regardless.
            .filter(|r| !r.converted && r.has_items() && r.updated_at < cutoff)
            .collect();

        crate::metrics::record_abandoned_found(found.len());
        debug!(count = found.len(), cutoff, "Abandonment query complete");
        Ok(found)
    }

    /// Hand each abandoned cart to `sink`. Returns how many were delivered.
    ///
    /// A failed delivery is logged and the scan moves on.
    #[tracing::instrument(skip(self, sink))]
    pub async fn notify_abandoned(&self, tenant_id: &str, sink: &dyn AbandonedCartSink) -> Result<usize, CartError> {
        let start = Instant::now();
        let carts = self.find_abandoned(tenant_id).await?;

        let mut delivered = 0;
        for cart in &carts {
            match sink.notify(cart).await {
                Ok(()) => {
                    delivered += 1;
                    crate::metrics::record_abandoned_notified("delivered");
                }
                Err(e) => {
                    warn!(cart_id = %cart.id, error = %e, "Abandoned-cart notification failed");
                    crate::metrics::record_abandoned_notified("failed");
                }
            }
        }

        crate::metrics::record_scan("abandonment", start.elapsed(), true);
        if !carts.is_empty() {
            info!(found = carts.len(), delivered, "Abandoned carts notified");
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::{Cart, CartItem};
    use crate::storage::memory::InMemoryDurableStore;
    use parking_lot::Mutex;

    const HOUR: i64 = 60 * 60 * 1000;

    fn record(session: &str, updated_at: i64, with_items: bool) -> PersistedCart {
        let mut cart = Cart::new("t1", session, Duration::from_secs(60));
        if with_items {
            cart.push_item(CartItem::new("a", "p", "s", "n", 1, 100).unwrap());
        }
        let mut r = PersistedCart::from_cart(cart, updated_at);
        r.updated_at = updated_at;
        r
    }

    async fn detector_with(records: Vec<PersistedCart>) -> AbandonmentDetector {
        let durable = Arc::new(InMemoryDurableStore::new());
        for r in &records {
            durable.save(r).await.unwrap();
        }
        AbandonmentDetector::new(durable, Duration::from_secs(24 * 60 * 60))
    }

    #[tokio::test]
    async fn test_cutoff_is_strict() {
        let now = 100 * HOUR;
        let detector = detector_with(vec![
            record("older", now - 24 * HOUR - 1, true),
            record("exact", now - 24 * HOUR, true),
            record("fresh", now - HOUR, true),
        ])
        .await;

        let found = detector.find_abandoned_as_of("t1", now).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["older"]);
    }

    #[tokio::test]
    async fn test_empty_and_converted_excluded() {
        let now = 100 * HOUR;
        let mut converted = record("converted", now - 48 * HOUR, true);
        converted.converted = true;
        let detector = detector_with(vec![record("empty", now - 48 * HOUR, false), converted]).await;

        assert!(detector.find_abandoned_as_of("t1", now).await.unwrap().is_empty());
    }

    struct RecordingSink {
        seen: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl AbandonedCartSink for RecordingSink {
        async fn notify(&self, cart: &PersistedCart) -> Result<(), NotifyError> {
            if self.fail_on.as_deref() == Some(cart.id.as_str()) {
                return Err(NotifyError::Unavailable("smtp down".into()));
            }
            self.seen.lock().push(cart.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notify_continues_past_failures() {
        let old = now_millis() - 48 * HOUR;
        let detector = detector_with(vec![record("a", old, true), record("b", old + 1, true)]).await;
        let sink = RecordingSink {
            seen: Mutex::new(Vec::new()),
            fail_on: Some("a".into()),
        };

        let delivered = detector.notify_abandoned("t1", &sink).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(*sink.seen.lock(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_threshold_update() {
        let now = 100 * HOUR;
        let detector = detector_with(vec![record("a", now - 2 * HOUR, true)]).await;
        assert!(detector.find_abandoned_as_of("t1", now).await.unwrap().is_empty());

        detector.set_threshold(Duration::from_secs(60 * 60));
        assert_eq!(detector.find_abandoned_as_of("t1", now).await.unwrap().len(), 1);
    }
}
