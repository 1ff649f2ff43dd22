//! Saved-for-later lists.
//!
//! Items move between a session's cart and a saved list under the same
//! union-by-id rule as sign-in merges. An unknown item id is rejected before
//! anything is written.

use tracing::debug;

use crate::cart::{now_millis, Cart, CartItem, SavedCart, SavedCartItem, SavedCartOwner};
use crate::error::CartError;
use crate::merge::{IdentityMergeService, MergeError};

use super::SyncCoordinator;

fn unknown(item_id: &str) -> CartError {
    MergeError::UnknownItem {
        item_id: item_id.to_string(),
    }
    .into()
}

impl SyncCoordinator {
    pub async fn saved_cart(&self, tenant_id: &str, owner: &SavedCartOwner) -> Result<Option<SavedCart>, CartError> {
        Ok(self.saved.get(tenant_id, owner).await?)
    }

    /// Move a cart line into the owner's saved list.
    ///
    /// If the list already holds an item with that id, the saved copy is kept.
    #[tracing::instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn save_for_later(
        &self,
        tenant_id: &str,
        session_id: &str,
        owner: &SavedCartOwner,
        item_id: &str,
    ) -> Result<(Cart, SavedCart), CartError> {
        let mut cart = self.load(tenant_id, session_id).await.ok_or_else(|| unknown(item_id))?;
        let mut saved = self
            .saved
            .get(tenant_id, owner)
            .await?
            .unwrap_or_else(|| SavedCart::new(tenant_id, owner.clone()));

        let now = now_millis();
        let source: Vec<SavedCartItem> = cart
            .items
            .iter()
            .cloned()
            .map(|item| SavedCartItem::from_cart_item(item, now))
            .collect();
        let (saved_items, remaining) = IdentityMergeService::merge_selected(source, saved.items, &[item_id])?;

        saved.items = saved_items;
        saved.reconcile_count();
        saved.updated_at = now;
        self.saved.save(&saved).await?;

        cart.items = remaining.into_iter().map(SavedCartItem::into_cart_item).collect();
        let cart = self.persist(cart).await;

        debug!(item_id, saved_count = saved.item_count, "Item saved for later");
        Ok((cart, saved))
    }

    /// Move a saved item back into the session's cart.
    ///
    /// Creates the cart if the session has none. If the cart already holds
    /// an item with that id, the cart copy is kept.
    #[tracing::instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn move_to_cart(
        &self,
        tenant_id: &str,
        session_id: &str,
        owner: &SavedCartOwner,
        item_id: &str,
    ) -> Result<(Cart, SavedCart), CartError> {
        let mut saved = self
            .saved
            .get(tenant_id, owner)
            .await?
            .ok_or_else(|| unknown(item_id))?;

        let mut cart = match self.load(tenant_id, session_id).await {
            Some(cart) => cart,
            None => self.new_cart(tenant_id, session_id).await,
        };

        let source: Vec<CartItem> = saved.items.iter().cloned().map(SavedCartItem::into_cart_item).collect();
        let (cart_items, _) = IdentityMergeService::merge_selected(source, cart.items, &[item_id])?;

        saved.remove_item(item_id);
        saved.updated_at = now_millis();
        self.saved.save(&saved).await?;

        cart.items = cart_items;
        let cart = self.persist(cart).await;

        debug!(item_id, saved_count = saved.item_count, "Saved item moved to cart");
        Ok((cart, saved))
    }

    /// Drop an entry from a saved list.
    #[tracing::instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn remove_saved_item(
        &self,
        tenant_id: &str,
        owner: &SavedCartOwner,
        item_id: &str,
    ) -> Result<SavedCart, CartError> {
        let mut saved = self
            .saved
            .get(tenant_id, owner)
            .await?
            .ok_or_else(|| unknown(item_id))?;

        saved.remove_item(item_id).ok_or_else(|| unknown(item_id))?;
        saved.updated_at = now_millis();
        self.saved.save(&saved).await?;
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, item};
    use super::*;
    use crate::storage::traits::SavedCartStore;

    fn owner() -> SavedCartOwner {
        SavedCartOwner::User("u1".into())
    }

    #[tokio::test]
    async fn test_save_for_later_moves_item() {
        let f = fixture();
        let mut cart = f.coordinator.new_cart("t1", "s1").await;
        cart.push_item(item("a", 2));
        cart.push_item(item("b", 1));
        f.coordinator.persist(cart).await;

        let (cart, saved) = f.coordinator.save_for_later("t1", "s1", &owner(), "a").await.unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].id, "b");
        assert_eq!(saved.items.len(), 1);
        assert_eq!(saved.item_count, 2);

        let stored = f.saved.get("t1", &owner()).await.unwrap().unwrap();
        assert_eq!(stored, saved);
    }

    #[tokio::test]
    async fn test_save_for_later_unknown_item_writes_nothing() {
        let f = fixture();
        let mut cart = f.coordinator.new_cart("t1", "s1").await;
        cart.push_item(item("a", 2));
        f.coordinator.persist(cart).await;

        let err = f.coordinator.save_for_later("t1", "s1", &owner(), "zzz").await.unwrap_err();
        assert!(matches!(err, CartError::Merge(MergeError::UnknownItem { .. })));
        assert!(f.saved.get("t1", &owner()).await.unwrap().is_none());
        assert_eq!(f.coordinator.load("t1", "s1").await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_move_to_cart_round_trip() {
        let f = fixture();
        let mut cart = f.coordinator.new_cart("t1", "s1").await;
        cart.push_item(item("a", 3));
        f.coordinator.persist(cart).await;

        f.coordinator.save_for_later("t1", "s1", &owner(), "a").await.unwrap();
        let (cart, saved) = f.coordinator.move_to_cart("t1", "s1", &owner(), "a").await.unwrap();

        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);
        assert!(saved.items.is_empty());
        assert_eq!(saved.item_count, 0);
    }

    #[tokio::test]
    async fn test_move_to_cart_creates_cart() {
        let f = fixture();
        let mut saved = SavedCart::new("t1", owner());
        saved.items.push(SavedCartItem::from_cart_item(item("a", 1), 0));
        saved.reconcile_count();
        f.saved.save(&saved).await.unwrap();

        let (cart, _) = f.coordinator.move_to_cart("t1", "fresh", &owner(), "a").await.unwrap();
        assert_eq!(cart.id, "fresh");
        assert_eq!(cart.items.len(), 1);
    }

    #[tokio::test]
    async fn test_move_to_cart_unknown_item() {
        let f = fixture();
        let err = f.coordinator.move_to_cart("t1", "s1", &owner(), "a").await.unwrap_err();
        assert!(matches!(err, CartError::Merge(MergeError::UnknownItem { .. })));
    }

    #[tokio::test]
    async fn test_remove_saved_item() {
        let f = fixture();
        let mut saved = SavedCart::new("t1", owner());
        saved.items.push(SavedCartItem::from_cart_item(item("a", 1), 0));
        saved.items.push(SavedCartItem::from_cart_item(item("b", 4), 0));
        saved.reconcile_count();
        f.saved.save(&saved).await.unwrap();

        let saved = f.coordinator.remove_saved_item("t1", &owner(), "a").await.unwrap();
        assert_eq!(saved.item_count, 4);

        let err = f.coordinator.remove_saved_item("t1", &owner(), "a").await.unwrap_err();
        assert!(matches!(err, CartError::Merge(_)));
    }
}
