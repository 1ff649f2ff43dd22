//! Identity merge: reconcile line-item lists when a guest signs in.
//!
//! One rule serves carts and saved-for-later lists: **union by item id**.
//! An incoming item is appended only if the target has no item with the same
//! id; on overlap the target copy wins. Quantities are never consolidated by
//! product, so the merge is idempotent.
//!
//! ```
//! use cart_engine::{CartItem, IdentityMergeService};
//!
//! let item = |id: &str| CartItem::new(id, "p", "s", "n", 1, 100).unwrap();
//! let merged = IdentityMergeService::merge_items(
//!     vec![item("A"), item("B")],
//!     vec![item("B"), item("C")],
//! );
//! let ids: Vec<_> = merged.iter().map(|i| i.id.as_str()).collect();
//! assert_eq!(ids, ["B", "C", "A"]);
//! ```

use std::collections::HashSet;

use thiserror::Error;

use crate::cart::{CartItem, SavedCartItem};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("Item {item_id} is not in the source list")]
    UnknownItem { item_id: String },
}

/// Anything mergeable by line-item id.
pub trait LineItem {
    fn item_id(&self) -> &str;
}

impl LineItem for CartItem {
    fn item_id(&self) -> &str {
        &self.id
    }
}

impl LineItem for SavedCartItem {
    fn item_id(&self) -> &str {
        &self.id
    }
}

/// Stateless merge rules.
pub struct IdentityMergeService;

impl IdentityMergeService {
    /// Union `incoming` into `target` by item id. Target order is kept and new
    /// items are appended in incoming order.
    #[must_use]
    pub fn merge_items<T: LineItem>(incoming: Vec<T>, mut target: Vec<T>) -> Vec<T> {
        let mut seen: HashSet<String> = target.iter().map(|i| i.item_id().to_string()).collect();
        for item in incoming {
            if seen.insert(item.item_id().to_string()) {
                target.push(item);
            }
        }
        target
    }

    /// Merge only the items named in `item_ids` from `source` into `target`.
    ///
    /// Fails if any id is missing from `source`; in that case nothing is
    /// merged. Returns the new target and the source minus the moved items.
    pub fn merge_selected<T: LineItem>(
        source: Vec<T>,
        target: Vec<T>,
        item_ids: &[&str],
    ) -> Result<(Vec<T>, Vec<T>), MergeError> {
        if let Some(missing) = item_ids
            .iter()
            .find(|id| !source.iter().any(|i| i.item_id() == **id))
        {
            return Err(MergeError::UnknownItem {
                item_id: (*missing).to_string(),
            });
        }

        let (selected, remaining): (Vec<T>, Vec<T>) = source
            .into_iter()
            .partition(|i| item_ids.contains(&i.item_id()));

        Ok((Self::merge_items(selected, target), remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, qty: u32) -> CartItem {
        CartItem::new(id, format!("p-{id}"), "SKU", "Thing", qty, 100).unwrap()
    }

    fn ids(items: &[CartItem]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_union_keeps_target_copy() {
        let merged = IdentityMergeService::merge_items(
            vec![item("A", 1), item("B", 9)],
            vec![item("B", 2), item("C", 1)],
        );
        assert_eq!(ids(&merged), ["B", "C", "A"]);
        assert_eq!(merged[0].quantity, 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let once = IdentityMergeService::merge_items(vec![item("A", 1)], vec![item("B", 1)]);
        let twice = IdentityMergeService::merge_items(vec![item("A", 1)], once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_same_product_different_ids_not_consolidated() {
        let a = CartItem::new("l1", "shirt", "S", "Shirt", 1, 100).unwrap();
        let b = CartItem::new("l2", "shirt", "S", "Shirt", 1, 100).unwrap();
        let merged = IdentityMergeService::merge_items(vec![a], vec![b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_into_empty_target() {
        let merged = IdentityMergeService::merge_items(vec![item("A", 1)], Vec::new());
        assert_eq!(ids(&merged), ["A"]);
    }

    #[test]
    fn test_merge_selected_moves_only_named() {
        let (target, remaining) = IdentityMergeService::merge_selected(
            vec![item("A", 1), item("B", 1), item("C", 1)],
            vec![item("X", 1)],
            &["A", "C"],
        )
        .unwrap();
        assert_eq!(ids(&target), ["X", "A", "C"]);
        assert_eq!(ids(&remaining), ["B"]);
    }

    #[test]
    fn test_merge_selected_unknown_id_fails() {
        let err = IdentityMergeService::merge_selected(
            vec![item("A", 1)],
            vec![item("X", 1)],
            &["A", "missing"],
        )
        .unwrap_err();
        assert_eq!(err, MergeError::UnknownItem { item_id: "missing".into() });
    }

    #[test]
    fn test_merge_saved_items() {
        let saved = |id: &str| SavedCartItem::from_cart_item(item(id, 1), 0);
        let merged = IdentityMergeService::merge_items(vec![saved("A"), saved("B")], vec![saved("B")]);
        let ids: Vec<&str> = merged.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["B", "A"]);
    }
}
