//! Redis backend for the ephemeral cart tier.
//!
//! Each cart is one JSON string with a native TTL:
//!
//! ```text
//! SET {prefix}cart:{tenant_id}:{session_id} <cart json> EX <ttl secs>
//! ```
//!
//! Tenant isolation comes from the key layout; there is one keyspace for all
//! tenants.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::cart::Cart;
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{EphemeralCartStore, StorageError};

pub struct RedisCartStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g. "shop:" → "shop:cart:t1:s1")
    prefix: String,
}

impl RedisCartStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use cart_engine::storage::redis::RedisCartStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will look like "shop:cart:tenant-a:sess-1"
    /// let store = RedisCartStore::with_prefix("redis://localhost", Some("shop:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn cart_key(&self, tenant_id: &str, session_id: &str) -> String {
        format!("{}cart:{}:{}", self.prefix, tenant_id, session_id)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl EphemeralCartStore for RedisCartStore {
    async fn get(&self, tenant_id: &str, session_id: &str) -> Result<Option<Cart>, StorageError> {
        let conn = self.connection.clone();
        let key = self.cart_key(tenant_id, session_id);

        let data: Option<String> = retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { conn.get::<_, Option<String>>(&key).await }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        data.map(|json| serde_json::from_str::<Cart>(&json).map_err(StorageError::from))
            .transpose()
    }

    async fn set(&self, cart: &Cart, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let key = self.cart_key(&cart.tenant_id, &cart.session_id);
        let json = serde_json::to_string(cart)?;
        let ttl_secs = ttl.as_secs().max(1);

        conn.set_ex::<_, _, ()>(&key, json, ttl_secs)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, tenant_id: &str, session_id: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let key = self.cart_key(tenant_id, session_id);

        conn.del::<_, ()>(&key)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
