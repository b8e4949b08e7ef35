use turnstile_store::StoreError;

use crate::models::PurchaseState;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Insufficient inventory: requested {requested}, available {available}")]
    Insufficient { requested: u32, available: u32 },

    #[error("Seat {seat} is no longer available")]
    SeatTaken { seat: u32 },

    #[error("Write conflict on {key}")]
    ConflictAbort { key: String },

    #[error("Order {order} is in state {actual}, expected {expected}")]
    StateGuardFailed {
        order: String,
        expected: String,
        actual: PurchaseState,
    },

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gave up after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl InventoryError {
    /// Lost an optimistic race; re-running from the read step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InventoryError::ConflictAbort { .. })
    }

    /// Expected under concurrent buyers: re-query and choose again.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            InventoryError::SeatTaken { .. } | InventoryError::ConflictAbort { .. }
        )
    }

    /// Must never be retried or repaired automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InventoryError::ConsistencyViolation(_))
    }

    pub fn malformed(key: &str, what: impl std::fmt::Display) -> Self {
        InventoryError::ConsistencyViolation(format!("{key}: {what}"))
    }
}

pub type InventoryResult<T> = Result<T, InventoryError>;
