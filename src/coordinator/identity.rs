//! Guest → user association on sign-in.

use tracing::{info, warn};

use crate::cart::{now_millis, Cart, PersistedCart, SavedCart, SavedCartOwner};
use crate::error::CartError;
use crate::merge::IdentityMergeService;
use crate::storage::traits::StorageError;

use super::SyncCoordinator;

impl SyncCoordinator {
    /// Attach the session's cart to a user.
    ///
    /// - user already has a cart: the session's items are unioned into it,
    ///   the user cart moves to this session, and the superseded session
    ///   record is deleted
    /// - no user cart: the session's record is tagged with the user
    /// - neither: `None`
    ///
    /// The session's saved-for-later list is folded into the user's list
    /// after the cart is written. A failed fold is logged and the merged cart
    /// is still returned; the session list stays until the next sign-in.
    /// All reads happen before the first write, so a durable failure leaves
    /// both tiers untouched. Calling it twice gives the same cart as once.
    #[tracing::instrument(skip(self))]
    pub async fn associate_with_user(
        &self,
        tenant_id: &str,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Cart>, CartError> {
        // Replicate anything still queued for this session first
        self.flush().await;

        let live_cart = match self.ephemeral.get(tenant_id, session_id).await {
            Ok(cart) => cart,
            Err(e) => {
                warn!(error = %e, "Ephemeral lookup failed during association, using durable copy");
                None
            }
        };
        let session_record = self.session_record(tenant_id, session_id).await?;
        let user_record = self.durable.find_by_user(tenant_id, user_id).await?;

        let session_owner = SavedCartOwner::Session(session_id.to_string());
        let user_owner = SavedCartOwner::User(user_id.to_string());
        let session_saved = self.saved.get(tenant_id, &session_owner).await?;
        let user_saved = match session_saved {
            Some(_) => self.saved.get(tenant_id, &user_owner).await?,
            None => None,
        };

        let session_cart = live_cart.or_else(|| session_record.as_ref().map(|r| r.cart.clone()));
        let now = now_millis();

        let (staged, superseded) = match (user_record, session_cart) {
            (Some(mut record), session_cart) => {
                let incoming = session_cart.map(|c| c.items).unwrap_or_default();
                record.cart.items = IdentityMergeService::merge_items(incoming, record.cart.items);
                record.cart.session_id = session_id.to_string();
                record.cart.updated_at = now;
                record.session_id = session_id.to_string();
                record.user_id = Some(user_id.to_string());
                record.last_synced_at = now;
                record.updated_at = now;

                let superseded = session_record.filter(|r| r.id != record.id);
                crate::metrics::record_merge("merged");
                (Some(record), superseded)
            }
            (None, Some(mut cart)) => {
                cart.updated_at = now;
                let mut record = match session_record {
                    Some(mut existing) => {
                        existing.sync_from(cart, now);
                        existing
                    }
                    None => PersistedCart::from_cart(cart, now),
                };
                record.user_id = Some(user_id.to_string());
                crate::metrics::record_merge("tagged");
                (Some(record), None)
            }
            (None, None) => {
                crate::metrics::record_merge("empty");
                (None, None)
            }
        };

        let merged = match staged {
            Some(record) => {
                self.durable.save(&record).await?;
                let cart = self.reseed(record.cart).await;

                if let Some(stale) = superseded {
                    if let Err(e) = self.durable.delete(tenant_id, &stale.id).await {
                        warn!(cart_id = %stale.id, error = %e, "Failed to delete superseded session cart");
                        crate::metrics::record_error("durable", "associate", "delete");
                    }
                }
                Some(cart)
            }
            None => None,
        };

        if let Some(session_list) = session_saved {
            let target = user_saved.unwrap_or_else(|| SavedCart::new(tenant_id, user_owner));
            if let Err(e) = self.fold_saved_list(session_list, target, now).await {
                warn!(error = %e, "Saved-list merge failed, session list kept");
                crate::metrics::record_error("saved", "associate", "merge");
            }
        }

        info!(
            cart_id = merged.as_ref().map(|c| c.id.as_str()).unwrap_or("-"),
            items = merged.as_ref().map_or(0, |c| c.items.len()),
            "Session associated with user"
        );
        Ok(merged)
    }

    /// Union a session's saved list into the user's and drop the session list.
    async fn fold_saved_list(
        &self,
        session_list: SavedCart,
        mut target: SavedCart,
        now: i64,
    ) -> Result<(), StorageError> {
        target.items = IdentityMergeService::merge_items(session_list.items, target.items);
        target.reconcile_count();
        target.updated_at = now;
        self.saved.save(&target).await?;
        self.saved.delete(&session_list.tenant_id, &session_list.owner).await
    }
}
