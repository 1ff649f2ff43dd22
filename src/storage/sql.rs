// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the durable cart tier and saved-for-later lists.
//!
//! One envelope row per cart, with the cart snapshot as JSON text and the
//! fields the scans need broken out into indexed columns:
//!
//! ```sql
//! CREATE TABLE persisted_carts (
//!   tenant_id      VARCHAR(64),
//!   id             VARCHAR(255),  -- == cart.id
//!   session_id     VARCHAR(255),
//!   user_id        VARCHAR(255),
//!   cart           LONGTEXT,      -- Cart as JSON
//!   item_count     BIGINT,        -- lines in the snapshot (abandonment filter)
//!   last_synced_at BIGINT,
//!   converted      BIGINT,        -- 0/1, never reset once 1
//!   order_id       VARCHAR(255),
//!   created_at     BIGINT,
//!   updated_at     BIGINT,
//!   PRIMARY KEY (tenant_id, id)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver has no boolean or JSON mapping that works for both MySQL
//! and SQLite, so `converted` is an integer and the snapshot is TEXT. MySQL
//! LONGTEXT comes back as bytes, hence [`text_column`].

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use crate::cart::{Cart, PersistedCart, SavedCart, SavedCartItem, SavedCartOwner};
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{DurableCartStore, SavedCartStore, StorageError};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const CART_COLUMNS: &str =
    "tenant_id, id, session_id, user_id, cart, last_synced_at, converted, order_id, created_at, updated_at";

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a text column. SQLite yields TEXT as `String`, MySQL LONGTEXT as bytes.
fn text_column(row: &AnyRow, name: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(name).ok().flatten().or_else(|| {
        row.try_get::<Option<Vec<u8>>, _>(name)
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn int_column(row: &AnyRow, name: &str) -> i64 {
    row.try_get::<i64, _>(name)
        .or_else(|_| row.try_get::<i32, _>(name).map(i64::from))
        .unwrap_or(0)
}

pub struct SqlCartStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlCartStore {
    /// Connect with startup-mode retry and create the schema if missing.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS persisted_carts (
                    tenant_id TEXT NOT NULL,
                    id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    user_id TEXT,
                    cart TEXT NOT NULL,
                    item_count INTEGER NOT NULL DEFAULT 0,
                    last_synced_at INTEGER NOT NULL,
                    converted INTEGER NOT NULL DEFAULT 0,
                    order_id TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_carts_session ON persisted_carts (tenant_id, session_id)",
                "CREATE INDEX IF NOT EXISTS idx_carts_user ON persisted_carts (tenant_id, user_id)",
                "CREATE INDEX IF NOT EXISTS idx_carts_age ON persisted_carts (tenant_id, converted, updated_at)",
                r#"
                CREATE TABLE IF NOT EXISTS saved_carts (
                    tenant_id TEXT NOT NULL,
                    owner_kind TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    items TEXT NOT NULL,
                    item_count INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, owner_kind, owner_id)
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS persisted_carts (
                    tenant_id VARCHAR(64) NOT NULL,
                    id VARCHAR(255) NOT NULL,
                    session_id VARCHAR(255) NOT NULL,
                    user_id VARCHAR(255),
                    cart LONGTEXT NOT NULL,
                    item_count BIGINT NOT NULL DEFAULT 0,
                    last_synced_at BIGINT NOT NULL,
                    converted BIGINT NOT NULL DEFAULT 0,
                    order_id VARCHAR(255),
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (tenant_id, id),
                    INDEX idx_carts_session (tenant_id, session_id),
                    INDEX idx_carts_user (tenant_id, user_id),
                    INDEX idx_carts_age (tenant_id, converted, updated_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS saved_carts (
                    tenant_id VARCHAR(64) NOT NULL,
                    owner_kind VARCHAR(16) NOT NULL,
                    owner_id VARCHAR(255) NOT NULL,
                    items LONGTEXT NOT NULL,
                    item_count BIGINT NOT NULL DEFAULT 0,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    PRIMARY KEY (tenant_id, owner_kind, owner_id)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    fn row_to_record(row: &AnyRow) -> Result<PersistedCart, StorageError> {
        let cart_json = text_column(row, "cart")
            .ok_or_else(|| StorageError::Backend("No cart payload in row".to_string()))?;
        let cart: Cart = serde_json::from_str(&cart_json)?;

        Ok(PersistedCart {
            id: text_column(row, "id").unwrap_or_else(|| cart.id.clone()),
            tenant_id: text_column(row, "tenant_id").unwrap_or_else(|| cart.tenant_id.clone()),
            session_id: text_column(row, "session_id").unwrap_or_else(|| cart.session_id.clone()),
            user_id: text_column(row, "user_id"),
            cart,
            last_synced_at: int_column(row, "last_synced_at"),
            converted: int_column(row, "converted") != 0,
            order_id: text_column(row, "order_id"),
            created_at: int_column(row, "created_at"),
            updated_at: int_column(row, "updated_at"),
        })
    }

    async fn fetch_one_record(
        &self,
        op: &str,
        sql: &str,
        binds: &[&str],
    ) -> Result<Option<PersistedCart>, StorageError> {
        let row = retry(op, &RetryConfig::query(), || async {
            let mut query = sqlx::query(sql);
            for value in binds {
                query = query.bind(*value);
            }
            query.fetch_optional(&self.pool).await.map_err(backend)
        })
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    fn upsert_sql(&self) -> &'static str {
        // A converted row keeps its contents and updated_at; only last_synced_at moves.
        // `converted` is assigned last: MySQL evaluates SET left to right.
        if self.is_sqlite {
            "INSERT INTO persisted_carts (tenant_id, id, session_id, user_id, cart, item_count, last_synced_at, converted, order_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, id) DO UPDATE SET
                session_id = CASE WHEN persisted_carts.converted = 1 THEN persisted_carts.session_id ELSE excluded.session_id END,
                user_id = CASE WHEN persisted_carts.converted = 1 THEN persisted_carts.user_id ELSE excluded.user_id END,
                cart = CASE WHEN persisted_carts.converted = 1 THEN persisted_carts.cart ELSE excluded.cart END,
                item_count = CASE WHEN persisted_carts.converted = 1 THEN persisted_carts.item_count ELSE excluded.item_count END,
                order_id = CASE WHEN persisted_carts.converted = 1 THEN persisted_carts.order_id ELSE excluded.order_id END,
                last_synced_at = excluded.last_synced_at,
                updated_at = CASE WHEN persisted_carts.converted = 1 THEN persisted_carts.updated_at ELSE excluded.updated_at END,
                converted = CASE WHEN persisted_carts.converted = 1 THEN 1 ELSE excluded.converted END"
        } else {
            "INSERT INTO persisted_carts (tenant_id, id, session_id, user_id, cart, item_count, last_synced_at, converted, order_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                session_id = CASE WHEN converted = 1 THEN session_id ELSE VALUES(session_id) END,
                user_id = CASE WHEN converted = 1 THEN user_id ELSE VALUES(user_id) END,
                cart = CASE WHEN converted = 1 THEN cart ELSE VALUES(cart) END,
                item_count = CASE WHEN converted = 1 THEN item_count ELSE VALUES(item_count) END,
                order_id = CASE WHEN converted = 1 THEN order_id ELSE VALUES(order_id) END,
                last_synced_at = VALUES(last_synced_at),
                updated_at = CASE WHEN converted = 1 THEN updated_at ELSE VALUES(updated_at) END,
                converted = CASE WHEN converted = 1 THEN 1 ELSE VALUES(converted) END"
        }
    }

    fn saved_upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO saved_carts (tenant_id, owner_kind, owner_id, items, item_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, owner_kind, owner_id) DO UPDATE SET
                items = excluded.items,
                item_count = excluded.item_count,
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO saved_carts (tenant_id, owner_kind, owner_id, items, item_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                items = VALUES(items),
                item_count = VALUES(item_count),
                updated_at = VALUES(updated_at)"
        }
    }
}

#[async_trait]
impl DurableCartStore for SqlCartStore {
    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<PersistedCart>, StorageError> {
        let sql = format!("SELECT {CART_COLUMNS} FROM persisted_carts WHERE tenant_id = ? AND id = ?");
        self.fetch_one_record("sql_find_by_id", &sql, &[tenant_id, id]).await
    }

    async fn find_by_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<PersistedCart>, StorageError> {
        let sql = format!(
            "SELECT {CART_COLUMNS} FROM persisted_carts WHERE tenant_id = ? AND session_id = ? \
             ORDER BY updated_at DESC LIMIT 1"
        );
        self.fetch_one_record("sql_find_by_session", &sql, &[tenant_id, session_id])
            .await
    }

    async fn find_by_user(&self, tenant_id: &str, user_id: &str) -> Result<Option<PersistedCart>, StorageError> {
        let sql = format!(
            "SELECT {CART_COLUMNS} FROM persisted_carts WHERE tenant_id = ? AND user_id = ? AND converted = 0 \
             ORDER BY updated_at DESC LIMIT 1"
        );
        self.fetch_one_record("sql_find_by_user", &sql, &[tenant_id, user_id])
            .await
    }

    async fn find_abandoned(
        &self,
        tenant_id: &str,
        updated_before: i64,
    ) -> Result<Vec<PersistedCart>, StorageError> {
        let sql = format!(
            "SELECT {CART_COLUMNS} FROM persisted_carts \
             WHERE tenant_id = ? AND converted = 0 AND item_count > 0 AND updated_at < ? \
             ORDER BY updated_at ASC"
        );

        let rows = retry("sql_find_abandoned", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(updated_before)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn save(&self, record: &PersistedCart) -> Result<(), StorageError> {
        let cart_json = serde_json::to_string(&record.cart)?;
        let item_count = i64::try_from(record.cart.items.len()).unwrap_or(i64::MAX);

        sqlx::query(self.upsert_sql())
            .bind(&record.tenant_id)
            .bind(&record.id)
            .bind(&record.session_id)
            .bind(&record.user_id)
            .bind(&cart_json)
            .bind(item_count)
            .bind(record.last_synced_at)
            .bind(i64::from(record.converted))
            .bind(&record.order_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        debug!(tenant_id = %record.tenant_id, cart_id = %record.id, "Persisted cart saved");
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM persisted_carts WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_converted_before(&self, tenant_id: &str, updated_before: i64) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM persisted_carts WHERE tenant_id = ? AND converted = 1 AND updated_at < ?",
        )
        .bind(tenant_id)
        .bind(updated_before)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected())
    }

    async fn tenant_ids(&self) -> Result<Vec<String>, StorageError> {
        let rows = retry("sql_tenant_ids", &RetryConfig::query(), || async {
            sqlx::query("SELECT DISTINCT tenant_id FROM persisted_carts ORDER BY tenant_id")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(rows.iter().filter_map(|row| text_column(row, "tenant_id")).collect())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(backend)
    }
}

#[async_trait]
impl SavedCartStore for SqlCartStore {
    async fn get(&self, tenant_id: &str, owner: &SavedCartOwner) -> Result<Option<SavedCart>, StorageError> {
        let row = retry("sql_saved_get", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT items, item_count, created_at, updated_at FROM saved_carts \
                 WHERE tenant_id = ? AND owner_kind = ? AND owner_id = ?",
            )
            .bind(tenant_id)
            .bind(owner.kind())
            .bind(owner.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
        })
        .await?;

        let Some(row) = row else { return Ok(None) };

        let items_json = text_column(&row, "items").unwrap_or_else(|| "[]".to_string());
        let items: Vec<SavedCartItem> = serde_json::from_str(&items_json)?;

        let mut saved = SavedCart {
            tenant_id: tenant_id.to_string(),
            owner: owner.clone(),
            items,
            item_count: 0,
            created_at: int_column(&row, "created_at"),
            updated_at: int_column(&row, "updated_at"),
        };
        saved.reconcile_count();
        Ok(Some(saved))
    }

    async fn save(&self, saved: &SavedCart) -> Result<(), StorageError> {
        let items_json = serde_json::to_string(&saved.items)?;
        let item_count = i64::try_from(saved.item_count).unwrap_or(i64::MAX);

        sqlx::query(self.saved_upsert_sql())
            .bind(&saved.tenant_id)
            .bind(saved.owner.kind())
            .bind(saved.owner.id())
            .bind(&items_json)
            .bind(item_count)
            .bind(saved.created_at)
            .bind(saved.updated_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, owner: &SavedCartOwner) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM saved_carts WHERE tenant_id = ? AND owner_kind = ? AND owner_id = ?")
            .bind(tenant_id)
            .bind(owner.kind())
            .bind(owner.id())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::CartItem;
    use tempfile::tempdir;

    async fn sqlite_store(dir: &tempfile::TempDir, name: &str) -> SqlCartStore {
        let path = dir.path().join(name);
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqlCartStore::new(&url).await.unwrap()
    }

    fn record(tenant: &str, session: &str, updated_at: i64) -> PersistedCart {
        let mut cart = Cart::new(tenant, session, Duration::from_secs(60));
        cart.push_item(
            CartItem::new("line-1", "p1", "SKU1", "Kettle", 2, 3499)
                .unwrap()
                .with_attribute("colour", "steel"),
        );
        let mut r = PersistedCart::from_cart(cart, updated_at);
        r.updated_at = updated_at;
        r
    }

    #[tokio::test]
    async fn test_save_and_find_by_id() {
        let dir = tempdir().unwrap();
        let store = sqlite_store(&dir, "find.db").await;

        let r = record("t1", "s1", 100);
        DurableCartStore::save(&store, &r).await.unwrap();

        let found = store.find_by_id("t1", "s1").await.unwrap().unwrap();
        assert_eq!(found, r);
        assert!(store.find_by_id("t2", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_session_and_user() {
        let dir = tempdir().unwrap();
        let store = sqlite_store(&dir, "lookup.db").await;

        let mut r = record("t1", "s1", 100);
        r.user_id = Some("u1".into());
        DurableCartStore::save(&store, &r).await.unwrap();

        assert!(store.find_by_session("t1", "s1").await.unwrap().is_some());
        let by_user = store.find_by_user("t1", "u1").await.unwrap().unwrap();
        assert_eq!(by_user.id, "s1");
    }

    #[tokio::test]
    async fn test_upsert_never_unconverts() {
        let dir = tempdir().unwrap();
        let store = sqlite_store(&dir, "convert.db").await;

        let mut r = record("t1", "s1", 100);
        r.converted = true;
        r.order_id = Some("order-1".into());
        DurableCartStore::save(&store, &r).await.unwrap();

        let mut stale = record("t1", "s1", 300);
        stale.cart.items.clear();
        DurableCartStore::save(&store, &stale).await.unwrap();

        let stored = store.find_by_id("t1", "s1").await.unwrap().unwrap();
        assert!(stored.converted);
        assert_eq!(stored.order_id.as_deref(), Some("order-1"));
        assert_eq!(stored.cart.items.len(), 1);
        assert_eq!(stored.updated_at, 100);
        assert_eq!(stored.last_synced_at, 300);
        assert_eq!(store.delete_converted_before("t1", 101).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_and_retention_queries() {
        let dir = tempdir().unwrap();
        let store = sqlite_store(&dir, "scan.db").await;

        DurableCartStore::save(&store, &record("t1", "old", 100)).await.unwrap();
        DurableCartStore::save(&store, &record("t1", "edge", 500)).await.unwrap();
        let mut empty = record("t1", "empty", 100);
        empty.cart.items.clear();
        DurableCartStore::save(&store, &empty).await.unwrap();
        let mut converted = record("t1", "done", 100);
        converted.converted = true;
        DurableCartStore::save(&store, &converted).await.unwrap();

        let abandoned = store.find_abandoned("t1", 500).await.unwrap();
        let ids: Vec<&str> = abandoned.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);

        let deleted = store.delete_converted_before("t1", 500).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.find_by_id("t1", "done").await.unwrap().is_none());
        assert!(store.find_by_id("t1", "old").await.unwrap().is_some());

        assert_eq!(store.tenant_ids().await.unwrap(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_saved_cart_round_trip() {
        let dir = tempdir().unwrap();
        let store = sqlite_store(&dir, "saved.db").await;

        let owner = SavedCartOwner::User("u1".into());
        let mut saved = SavedCart::new("t1", owner.clone());
        let item = CartItem::new("line-1", "p1", "SKU1", "Kettle", 3, 3499).unwrap();
        saved.items.push(SavedCartItem::from_cart_item(item, 10));
        saved.reconcile_count();
        SavedCartStore::save(&store, &saved).await.unwrap();

        let loaded = SavedCartStore::get(&store, "t1", &owner).await.unwrap().unwrap();
        assert_eq!(loaded.items, saved.items);
        assert_eq!(loaded.item_count, 3);

        SavedCartStore::delete(&store, "t1", &owner).await.unwrap();
        assert!(SavedCartStore::get(&store, "t1", &owner).await.unwrap().is_none());
    }
}
