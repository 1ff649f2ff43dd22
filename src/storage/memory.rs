//! In-process stores backed by `DashMap`.
//!
//! Used when no Redis/SQL URL is configured, and throughout the tests.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cart::{Cart, PersistedCart, SavedCart, SavedCartOwner};
use super::traits::{apply_upsert, DurableCartStore, EphemeralCartStore, SavedCartStore, StorageError};

type TenantKey = (String, String);

fn key(tenant_id: &str, id: &str) -> TenantKey {
    (tenant_id.to_string(), id.to_string())
}

/// TTL-aware ephemeral tier. Expired entries are dropped lazily on read.
pub struct InMemoryEphemeralStore {
    data: DashMap<TenantKey, (Cart, Instant)>,
}

impl InMemoryEphemeralStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Live (unexpired) entry count
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| e.value().1 > now).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, as if all TTLs elapsed or the process restarted.
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryEphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralCartStore for InMemoryEphemeralStore {
    async fn get(&self, tenant_id: &str, session_id: &str) -> Result<Option<Cart>, StorageError> {
        let k = key(tenant_id, session_id);
        let hit = match self.data.get(&k) {
            Some(entry) if entry.value().1 > Instant::now() => return Ok(Some(entry.value().0.clone())),
            Some(_) => true,
            None => false,
        };
        if hit {
            self.data.remove(&k);
        }
        Ok(None)
    }

    async fn set(&self, cart: &Cart, ttl: Duration) -> Result<(), StorageError> {
        let deadline = Instant::now() + ttl;
        self.data
            .insert(key(&cart.tenant_id, &cart.session_id), (cart.clone(), deadline));
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, session_id: &str) -> Result<(), StorageError> {
        self.data.remove(&key(tenant_id, session_id));
        Ok(())
    }
}

/// Durable tier kept in process memory.
pub struct InMemoryDurableStore {
    data: DashMap<TenantKey, PersistedCart>,
}

impl InMemoryDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn latest<F>(&self, tenant_id: &str, pred: F) -> Option<PersistedCart>
    where
        F: Fn(&PersistedCart) -> bool,
    {
        self.data
            .iter()
            .filter(|e| e.key().0 == tenant_id && pred(e.value()))
            .max_by_key(|e| e.value().updated_at)
            .map(|e| e.value().clone())
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableCartStore for InMemoryDurableStore {
    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<PersistedCart>, StorageError> {
        Ok(self.data.get(&key(tenant_id, id)).map(|r| r.value().clone()))
    }

    async fn find_by_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<PersistedCart>, StorageError> {
        Ok(self.latest(tenant_id, |r| r.session_id == session_id))
    }

    async fn find_by_user(&self, tenant_id: &str, user_id: &str) -> Result<Option<PersistedCart>, StorageError> {
        Ok(self.latest(tenant_id, |r| {
            !r.converted && r.user_id.as_deref() == Some(user_id)
        }))
    }

    async fn find_abandoned(
        &self,
        tenant_id: &str,
        updated_before: i64,
    ) -> Result<Vec<PersistedCart>, StorageError> {
        let mut found: Vec<PersistedCart> = self
            .data
            .iter()
            .filter(|e| {
                let r = e.value();
                e.key().0 == tenant_id && !r.converted && r.updated_at < updated_before && r.has_items()
            })
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|r| r.updated_at);
        Ok(found)
    }

    async fn save(&self, record: &PersistedCart) -> Result<(), StorageError> {
        let k = key(&record.tenant_id, &record.id);
        let mut entry = self.data.entry(k).or_insert_with(|| record.clone());
        let merged = apply_upsert(Some(entry.value()), record);
        *entry.value_mut() = merged;
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), StorageError> {
        self.data.remove(&key(tenant_id, id));
        Ok(())
    }

    async fn delete_converted_before(&self, tenant_id: &str, updated_before: i64) -> Result<u64, StorageError> {
        let mut removed = 0u64;
        self.data.retain(|k, r| {
            let expired = k.0 == tenant_id && r.converted && r.updated_at < updated_before;
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }

    async fn tenant_ids(&self) -> Result<Vec<String>, StorageError> {
        let tenants: BTreeSet<String> = self.data.iter().map(|e| e.key().0.clone()).collect();
        Ok(tenants.into_iter().collect())
    }
}

/// Saved-for-later lists kept in process memory.
pub struct InMemorySavedCartStore {
    data: DashMap<(String, SavedCartOwner), SavedCart>,
}

impl InMemorySavedCartStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemorySavedCartStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SavedCartStore for InMemorySavedCartStore {
    async fn get(&self, tenant_id: &str, owner: &SavedCartOwner) -> Result<Option<SavedCart>, StorageError> {
        Ok(self
            .data
            .get(&(tenant_id.to_string(), owner.clone()))
            .map(|r| r.value().clone()))
    }

    async fn save(&self, saved: &SavedCart) -> Result<(), StorageError> {
        self.data
            .insert((saved.tenant_id.clone(), saved.owner.clone()), saved.clone());
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, owner: &SavedCartOwner) -> Result<(), StorageError> {
        self.data.remove(&(tenant_id.to_string(), owner.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::CartItem;
    use std::sync::Arc;

    fn cart(tenant: &str, session: &str) -> Cart {
        let mut cart = Cart::new(tenant, session, Duration::from_secs(60));
        cart.push_item(CartItem::new("line-1", "p1", "SKU1", "Lamp", 1, 2000).unwrap());
        cart
    }

    fn record(tenant: &str, session: &str, updated_at: i64) -> PersistedCart {
        let mut r = PersistedCart::from_cart(cart(tenant, session), updated_at);
        r.updated_at = updated_at;
        r
    }

    #[tokio::test]
    async fn test_ephemeral_set_and_get() {
        let store = InMemoryEphemeralStore::new();
        let c = cart("t1", "s1");
        store.set(&c, Duration::from_secs(60)).await.unwrap();

        let got = store.get("t1", "s1").await.unwrap();
        assert_eq!(got, Some(c));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_is_tenant_scoped() {
        let store = InMemoryEphemeralStore::new();
        store.set(&cart("t1", "s1"), Duration::from_secs(60)).await.unwrap();
        assert!(store.get("t2", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ephemeral_expiry() {
        let store = InMemoryEphemeralStore::new();
        store.set(&cart("t1", "s1"), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("t1", "s1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_delete_nonexistent_is_ok() {
        let store = InMemoryEphemeralStore::new();
        assert!(store.delete("t1", "missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_durable_find_by_session_and_user() {
        let store = InMemoryDurableStore::new();
        let mut r = record("t1", "s1", 100);
        r.user_id = Some("u1".into());
        store.save(&r).await.unwrap();

        assert!(store.find_by_session("t1", "s1").await.unwrap().is_some());
        assert!(store.find_by_user("t1", "u1").await.unwrap().is_some());
        assert!(store.find_by_user("t2", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_durable_find_by_user_skips_converted() {
        let store = InMemoryDurableStore::new();
        let mut r = record("t1", "s1", 100);
        r.user_id = Some("u1".into());
        r.converted = true;
        store.save(&r).await.unwrap();

        assert!(store.find_by_user("t1", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_durable_save_never_unconverts() {
        let store = InMemoryDurableStore::new();
        let mut r = record("t1", "s1", 100);
        r.converted = true;
        r.order_id = Some("o-1".into());
        store.save(&r).await.unwrap();

        let stale = record("t1", "s1", 200);
        store.save(&stale).await.unwrap();

        let stored = store.find_by_id("t1", "s1").await.unwrap().unwrap();
        assert!(stored.converted);
        assert_eq!(stored.order_id.as_deref(), Some("o-1"));
        assert_eq!(stored.updated_at, 100);
        assert_eq!(stored.last_synced_at, 200);
    }

    #[tokio::test]
    async fn test_durable_abandoned_query() {
        let store = InMemoryDurableStore::new();
        store.save(&record("t1", "old", 100)).await.unwrap();
        store.save(&record("t1", "edge", 500)).await.unwrap();
        store.save(&record("t1", "new", 900)).await.unwrap();
        let mut empty = record("t1", "empty", 100);
        empty.cart.items.clear();
        store.save(&empty).await.unwrap();
        store.save(&record("t2", "other-tenant", 100)).await.unwrap();

        let found = store.find_abandoned("t1", 500).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[tokio::test]
    async fn test_durable_delete_converted_before() {
        let store = InMemoryDurableStore::new();
        let mut old_converted = record("t1", "a", 100);
        old_converted.converted = true;
        let mut young_converted = record("t1", "b", 900);
        young_converted.converted = true;
        store.save(&old_converted).await.unwrap();
        store.save(&young_converted).await.unwrap();
        store.save(&record("t1", "c", 1)).await.unwrap();

        let deleted = store.delete_converted_before("t1", 500).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_durable_tenant_ids() {
        let store = InMemoryDurableStore::new();
        store.save(&record("b", "s1", 1)).await.unwrap();
        store.save(&record("a", "s1", 1)).await.unwrap();
        store.save(&record("a", "s2", 1)).await.unwrap();
        assert_eq!(store.tenant_ids().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_saved_store_round_trip() {
        let store = InMemorySavedCartStore::new();
        let owner = SavedCartOwner::User("u1".into());
        let saved = SavedCart::new("t1", owner.clone());
        store.save(&saved).await.unwrap();

        assert_eq!(store.get("t1", &owner).await.unwrap(), Some(saved));
        assert!(store.get("t2", &owner).await.unwrap().is_none());

        store.delete("t1", &owner).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_saves() {
        let store = Arc::new(InMemoryDurableStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let r = record("t1", &format!("s-{batch}-{i}"), 1);
                    store.save(&r).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
