// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cart data model.
//!
//! The [`Cart`] is the live aggregate held by the ephemeral tier. The durable
//! tier wraps each cart in a [`PersistedCart`] envelope carrying ownership and
//! conversion bookkeeping.
//!
//! All timestamps are epoch milliseconds and all money values are minor
//! currency units (cents, pence).
//!
//! # Example
//!
//! ```
//! use cart_engine::{Cart, CartItem};
//! use std::time::Duration;
//!
//! let mut cart = Cart::new("tenant-a", "sess-1", Duration::from_secs(3600));
//! assert_eq!(cart.id, "sess-1");
//!
//! let item = CartItem::new("line-1", "prod-9", "SKU-9", "Mug", 2, 1250).unwrap();
//! cart.push_item(item);
//! assert_eq!(cart.item_quantity(), 2);
//! assert!(cart.has_items());
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CartError;

/// Current time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
#[must_use]
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Item attributes such as size or colour.
///
/// Sorted so equality and serialization are stable.
pub type ItemAttributes = BTreeMap<String, String>;

/// A single line in a cart.
///
/// Uniqueness inside a cart is by `id`, not `product_id`: the same product
/// added with different attributes is two line items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    pub product_id: String,
    pub sku: String,
    pub name: String,
    /// Always positive
    pub quantity: u32,
    /// Unit price (minor units)
    pub price: i64,
    /// `price * quantity` at the time the line was written (minor units)
    pub subtotal: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: ItemAttributes,
}

impl CartItem {
    /// Create a line item. Rejects a zero quantity.
    pub fn new(
        id: impl Into<String>,
        product_id: impl Into<String>,
        sku: impl Into<String>,
        name: impl Into<String>,
        quantity: u32,
        price: i64,
    ) -> Result<Self, CartError> {
        if quantity == 0 {
            return Err(CartError::InvalidQuantity { quantity });
        }
        Ok(Self {
            id: id.into(),
            product_id: product_id.into(),
            sku: sku.into(),
            name: name.into(),
            quantity,
            price,
            subtotal: price.saturating_mul(i64::from(quantity)),
            image_url: None,
            attributes: ItemAttributes::new(),
        })
    }

    #[must_use]
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Derived totals. Computed by pricing collaborators; opaque to this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSummary {
    pub subtotal: i64,
    pub shipping: i64,
    pub tax: i64,
    pub total: i64,
}

/// The live shopping-cart aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    /// Stable identity, never reassigned. The creating session id, or
    /// `{session_id}.{n}` for a later cart after a checkout in that session.
    pub id: String,
    pub tenant_id: String,
    /// Session currently owning the cart
    pub session_id: String,
    /// Line items in insertion order
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub summary: CartSummary,
    pub created_at: i64,
    pub updated_at: i64,
    /// Drives the ephemeral TTL; extended on recovery
    pub expires_at: i64,
}

impl Cart {
    /// Create an empty cart for a session, expiring `ttl` from now.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, session_id: impl Into<String>, ttl: Duration) -> Self {
        let session_id = session_id.into();
        let now = now_millis();
        Self {
            id: session_id.clone(),
            tenant_id: tenant_id.into(),
            session_id,
            items: Vec::new(),
            summary: CartSummary::default(),
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(duration_millis(ttl)),
        }
    }

    #[must_use]
    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    /// Sum of quantities across all lines.
    #[must_use]
    pub fn item_quantity(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    #[must_use]
    pub fn contains_item(&self, item_id: &str) -> bool {
        self.items.iter().any(|i| i.id == item_id)
    }

    /// Append a line. Replaces an existing line with the same id in place.
    pub fn push_item(&mut self, item: CartItem) {
        match self.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    /// Remove a line by id, returning it.
    pub fn remove_item(&mut self, item_id: &str) -> Option<CartItem> {
        let pos = self.items.iter().position(|i| i.id == item_id)?;
        Some(self.items.remove(pos))
    }

    /// Remaining TTL relative to `now`, never below one second.
    #[must_use]
    pub fn ttl_from(&self, now: i64) -> Duration {
        let remaining = self.expires_at.saturating_sub(now).max(1000);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(1000))
    }
}

/// Durable envelope around a cart snapshot.
///
/// `id` always equals `cart.id`. Once `converted` is set it is never
/// cleared, and the embedded cart no longer changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCart {
    pub id: String,
    pub tenant_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub cart: Cart,
    /// Last successful write-behind from the ephemeral tier
    pub last_synced_at: i64,
    pub converted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub created_at: i64,
    /// Record-level modification time; drives abandonment and retention age
    pub updated_at: i64,
}

impl PersistedCart {
    /// Wrap a cart snapshot in a fresh, unconverted envelope.
    #[must_use]
    pub fn from_cart(cart: Cart, now: i64) -> Self {
        Self {
            id: cart.id.clone(),
            tenant_id: cart.tenant_id.clone(),
            session_id: cart.session_id.clone(),
            user_id: None,
            cart,
            last_synced_at: now,
            converted: false,
            order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the embedded snapshot (write-behind path).
    pub fn sync_from(&mut self, cart: Cart, now: i64) {
        self.session_id = cart.session_id.clone();
        self.cart = cart;
        self.last_synced_at = now;
        self.updated_at = now;
    }

    #[must_use]
    pub fn has_items(&self) -> bool {
        self.cart.has_items()
    }
}

/// Owner of a saved-for-later list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SavedCartOwner {
    User(String),
    Session(String),
}

impl SavedCartOwner {
    /// Storage discriminator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Session(_) => "session",
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Session(id) => id,
        }
    }

    /// Rebuild from the storage discriminator.
    #[must_use]
    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "user" => Some(Self::User(id)),
            "session" => Some(Self::Session(id)),
            _ => None,
        }
    }
}

impl std::fmt::Display for SavedCartOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A cart line mirrored into a saved-for-later list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCartItem {
    pub id: String,
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub price: i64,
    pub subtotal: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: ItemAttributes,
    pub saved_at: i64,
}

impl SavedCartItem {
    #[must_use]
    pub fn from_cart_item(item: CartItem, saved_at: i64) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            sku: item.sku,
            name: item.name,
            quantity: item.quantity,
            price: item.price,
            subtotal: item.subtotal,
            image_url: item.image_url,
            attributes: item.attributes,
            saved_at,
        }
    }

    /// Back into a cart line.
    #[must_use]
    pub fn into_cart_item(self) -> CartItem {
        CartItem {
            id: self.id,
            product_id: self.product_id,
            sku: self.sku,
            name: self.name,
            quantity: self.quantity,
            price: self.price,
            subtotal: self.subtotal,
            image_url: self.image_url,
            attributes: self.attributes,
        }
    }
}

/// Non-expiring "save for later" list.
///
/// `item_count` is the sum of quantities and is reconciled by every mutator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCart {
    pub tenant_id: String,
    pub owner: SavedCartOwner,
    pub items: Vec<SavedCartItem>,
    pub item_count: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SavedCart {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, owner: SavedCartOwner) -> Self {
        let now = now_millis();
        Self {
            tenant_id: tenant_id.into(),
            owner,
            items: Vec::new(),
            item_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn contains_item(&self, item_id: &str) -> bool {
        self.items.iter().any(|i| i.id == item_id)
    }

    /// Remove an entry by id, returning it. Reconciles `item_count`.
    pub fn remove_item(&mut self, item_id: &str) -> Option<SavedCartItem> {
        let pos = self.items.iter().position(|i| i.id == item_id)?;
        let removed = self.items.remove(pos);
        self.reconcile_count();
        Some(removed)
    }

    /// Recompute `item_count` from the items.
    pub fn reconcile_count(&mut self) {
        self.item_count = self.items.iter().map(|i| u64::from(i.quantity)).sum();
    }
}
