//! Retention sweep: physically delete converted carts past the retention age.
//!
//! Only converted records are ever deleted here. A live cart that has been
//! idle for years stays put.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::info;

use crate::cart::{duration_millis, now_millis};
use crate::error::CartError;
use crate::storage::traits::DurableCartStore;

pub struct RetentionSweeper {
    durable: Arc<dyn DurableCartStore>,
    retention: RwLock<Duration>,
}

impl RetentionSweeper {
    pub fn new(durable: Arc<dyn DurableCartStore>, retention: Duration) -> Self {
        Self {
            durable,
            retention: RwLock::new(retention),
        }
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        *self.retention.read()
    }

    pub fn set_retention(&self, retention: Duration) {
        *self.retention.write() = retention;
    }

    /// Delete converted carts older than the retention age. Returns the count.
    pub async fn cleanup(&self, tenant_id: &str) -> Result<u64, CartError> {
        self.cleanup_as_of(tenant_id, now_millis()).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn cleanup_as_of(&self, tenant_id: &str, now: i64) -> Result<u64, CartError> {
        let start = Instant::now();
        let cutoff = now.saturating_sub(duration_millis(self.retention()));

        let deleted = match self.durable.delete_converted_before(tenant_id, cutoff).await {
            Ok(n) => n,
            Err(e) => {
                crate::metrics::record_scan("retention", start.elapsed(), false);
                return Err(e.into());
            }
        };

        crate::metrics::record_retention_deleted(deleted);
        crate::metrics::record_scan("retention", start.elapsed(), true);
        if deleted > 0 {
            info!(deleted, cutoff, "Retention sweep removed converted carts");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::{Cart, PersistedCart};
    use crate::storage::memory::InMemoryDurableStore;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    fn record(session: &str, updated_at: i64, converted: bool) -> PersistedCart {
        let cart = Cart::new("t1", session, Duration::from_secs(60));
        let mut r = PersistedCart::from_cart(cart, updated_at);
        r.updated_at = updated_at;
        r.converted = converted;
        r
    }

    #[tokio::test]
    async fn test_only_old_converted_records_deleted() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let now = 1000 * DAY;
        for r in [
            record("old-converted", now - 91 * DAY, true),
            record("exact-converted", now - 90 * DAY, true),
            record("new-converted", now - DAY, true),
            record("old-live", now - 400 * DAY, false),
        ] {
            durable.save(&r).await.unwrap();
        }

        let sweeper = RetentionSweeper::new(durable.clone(), Duration::from_secs(90 * 24 * 60 * 60));
        assert_eq!(sweeper.cleanup_as_of("t1", now).await.unwrap(), 1);

        assert!(durable.find_by_id("t1", "old-converted").await.unwrap().is_none());
        assert!(durable.find_by_id("t1", "exact-converted").await.unwrap().is_some());
        assert!(durable.find_by_id("t1", "new-converted").await.unwrap().is_some());
        assert!(durable.find_by_id("t1", "old-live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_is_tenant_scoped() {
        let durable = Arc::new(InMemoryDurableStore::new());
        durable.save(&record("old", 0, true)).await.unwrap();

        let sweeper = RetentionSweeper::new(durable.clone(), Duration::from_secs(1));
        assert_eq!(sweeper.cleanup_as_of("t2", 10 * DAY).await.unwrap(), 0);
        assert_eq!(sweeper.cleanup("t1").await.unwrap(), 1);
    }
}
