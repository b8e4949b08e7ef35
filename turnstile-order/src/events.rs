use serde::{Deserialize, Serialize};

use turnstile_core::{OrderId, Purchase, PurchaseState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailReason {
    Declined,
    HoldExpired,
    QuantityMismatch,
    SeatsUnavailable,
    Cancelled,
}

/// Published once per order when it reaches COMPLETE or FAIL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseEvent {
    pub order_id: OrderId,
    pub state: PurchaseState,
    pub reason: Option<FailReason>,
    pub record: Purchase,
}

impl PurchaseEvent {
    pub fn new(record: Purchase, reason: Option<FailReason>) -> Self {
        Self {
            order_id: record.order_id.clone(),
            state: record.state,
            reason,
            record,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
