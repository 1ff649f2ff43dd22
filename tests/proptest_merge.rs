//! Property-based tests for the merge rule and saved-list bookkeeping.
//!
//! Run with: `cargo test --test proptest_merge`

use std::collections::HashSet;

use proptest::prelude::*;

use cart_engine::{CartItem, IdentityMergeService, MergeError, SavedCart, SavedCartItem, SavedCartOwner};

// =============================================================================
// Strategies
// =============================================================================

/// Line items drawn from a small id space so overlaps are common.
fn item_strategy() -> impl Strategy<Value = CartItem> {
    ("[a-f]", 1u32..20, 0i64..100_000)
        .prop_map(|(id, qty, price)| CartItem::new(id.clone(), format!("prod-{id}"), "SKU", "Thing", qty, price).unwrap())
}

/// A list with unique ids, as carts always are.
fn unique_items_strategy() -> impl Strategy<Value = Vec<CartItem>> {
    prop::collection::vec(item_strategy(), 0..8).prop_map(|items| {
        let mut seen = HashSet::new();
        items.into_iter().filter(|i| seen.insert(i.id.clone())).collect()
    })
}

fn ids(items: &[CartItem]) -> Vec<String> {
    items.iter().map(|i| i.id.clone()).collect()
}

// =============================================================================
// Merge properties
// =============================================================================

proptest! {
    #[test]
    fn merge_is_idempotent(incoming in unique_items_strategy(), target in unique_items_strategy()) {
        let once = IdentityMergeService::merge_items(incoming.clone(), target);
        let twice = IdentityMergeService::merge_items(incoming, once.clone());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merge_keeps_target_prefix_and_copies(incoming in unique_items_strategy(), target in unique_items_strategy()) {
        let merged = IdentityMergeService::merge_items(incoming.clone(), target.clone());

        // target untouched and first
        prop_assert_eq!(&merged[..target.len()], &target[..]);

        // appended items are exactly the incoming ones the target lacked, in order
        let target_ids: HashSet<String> = ids(&target).into_iter().collect();
        let expected_tail: Vec<String> = ids(&incoming).into_iter().filter(|id| !target_ids.contains(id)).collect();
        prop_assert_eq!(ids(&merged[target.len()..]), expected_tail);
    }

    #[test]
    fn merge_never_duplicates_ids(incoming in unique_items_strategy(), target in unique_items_strategy()) {
        let merged = IdentityMergeService::merge_items(incoming, target);
        let unique: HashSet<String> = ids(&merged).into_iter().collect();
        prop_assert_eq!(unique.len(), merged.len());
    }

    #[test]
    fn merge_selected_is_all_or_nothing(
        source in unique_items_strategy(),
        target in unique_items_strategy(),
        wanted in prop::collection::vec("[a-h]", 1..4),
    ) {
        let wanted: Vec<&str> = wanted.iter().map(String::as_str).collect();
        let result = IdentityMergeService::merge_selected(source.clone(), target.clone(), &wanted);

        let source_ids: HashSet<String> = ids(&source).into_iter().collect();
        match result {
            Ok((merged, remaining)) => {
                prop_assert!(wanted.iter().all(|id| source_ids.contains(*id)));
                prop_assert_eq!(remaining.len() + wanted.iter().collect::<HashSet<_>>().len(), source.len());
                prop_assert!(wanted.iter().all(|id| merged.iter().any(|i| i.id == *id)));
            }
            Err(MergeError::UnknownItem { item_id }) => {
                prop_assert!(!source_ids.contains(&item_id));
            }
        }
    }
}

// =============================================================================
// Saved-list count invariant
// =============================================================================

#[derive(Debug, Clone)]
enum SavedOp {
    Add(CartItem),
    Remove(String),
}

fn saved_op_strategy() -> impl Strategy<Value = SavedOp> {
    prop_oneof![
        item_strategy().prop_map(SavedOp::Add),
        "[a-f]".prop_map(SavedOp::Remove),
    ]
}

proptest! {
    #[test]
    fn saved_count_equals_quantity_sum(ops in prop::collection::vec(saved_op_strategy(), 0..30)) {
        let mut saved = SavedCart::new("t1", SavedCartOwner::User("u1".into()));

        for op in ops {
            match op {
                SavedOp::Add(item) => {
                    saved.items = IdentityMergeService::merge_items(
                        vec![SavedCartItem::from_cart_item(item, 0)],
                        std::mem::take(&mut saved.items),
                    );
                    saved.reconcile_count();
                }
                SavedOp::Remove(id) => {
                    saved.remove_item(&id);
                }
            }
            let sum: u64 = saved.items.iter().map(|i| u64::from(i.quantity)).sum();
            prop_assert_eq!(saved.item_count, sum);
        }
    }
}
