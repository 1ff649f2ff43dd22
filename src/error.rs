//! Errors surfaced by cart operations.

use thiserror::Error;

use crate::merge::MergeError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum CartError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("Cart item quantity must be positive, got {quantity}")]
    InvalidQuantity { quantity: u32 },
    #[error("Cart engine not started")]
    NotStarted,
    #[error("Cart engine is shutting down")]
    ShuttingDown,
}
