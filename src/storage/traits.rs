use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cart::{Cart, PersistedCart, SavedCart, SavedCartOwner};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Failed to (de)serialize stored cart: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Fast, TTL-bound tier keyed by `(tenant_id, session_id)`.
#[async_trait]
pub trait EphemeralCartStore: Send + Sync {
    async fn get(&self, tenant_id: &str, session_id: &str) -> Result<Option<Cart>, StorageError>;

    /// Store under `(cart.tenant_id, cart.session_id)` for `ttl`.
    async fn set(&self, cart: &Cart, ttl: Duration) -> Result<(), StorageError>;

    async fn delete(&self, tenant_id: &str, session_id: &str) -> Result<(), StorageError>;

    /// Connectivity probe. In-process stores are always reachable.
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Authoritative, non-expiring tier of [`PersistedCart`] envelopes.
///
/// Every lookup is scoped by tenant. `save` is an upsert with one rule: if
/// the stored record is already converted, only `last_synced_at` is taken
/// from the incoming record. `updated_at` stays at the conversion time so the
/// retention clock never restarts.
#[async_trait]
pub trait DurableCartStore: Send + Sync {
    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<PersistedCart>, StorageError>;

    /// Most recently updated record owned by the session, converted or not.
    async fn find_by_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<PersistedCart>, StorageError>;

    /// Most recently updated non-converted record associated with the user.
    async fn find_by_user(&self, tenant_id: &str, user_id: &str) -> Result<Option<PersistedCart>, StorageError>;

    /// Non-converted records with items, updated strictly before `updated_before`.
    async fn find_abandoned(
        &self,
        tenant_id: &str,
        updated_before: i64,
    ) -> Result<Vec<PersistedCart>, StorageError>;

    async fn save(&self, record: &PersistedCart) -> Result<(), StorageError>;

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), StorageError>;

    /// Delete converted records updated strictly before `updated_before`.
    /// Returns the number of records removed.
    async fn delete_converted_before(&self, tenant_id: &str, updated_before: i64) -> Result<u64, StorageError>;

    /// Distinct tenants with at least one record (drives scheduled scans).
    async fn tenant_ids(&self) -> Result<Vec<String>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Non-expiring saved-for-later lists.
#[async_trait]
pub trait SavedCartStore: Send + Sync {
    async fn get(&self, tenant_id: &str, owner: &SavedCartOwner) -> Result<Option<SavedCart>, StorageError>;
    async fn save(&self, saved: &SavedCart) -> Result<(), StorageError>;
    async fn delete(&self, tenant_id: &str, owner: &SavedCartOwner) -> Result<(), StorageError>;
}

/// Apply the converted-record rule to an upsert.
///
/// Shared by the in-process stores so they match the SQL upsert.
#[must_use]
pub fn apply_upsert(existing: Option<&PersistedCart>, incoming: &PersistedCart) -> PersistedCart {
    match existing {
        Some(current) if current.converted => {
            let mut kept = current.clone();
            kept.last_synced_at = incoming.last_synced_at;
            kept
        }
        _ => incoming.clone(),
    }
}
