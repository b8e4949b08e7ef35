use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use turnstile_core::CustomerId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthDecision {
    Approved,
    Declined,
}

/// The credit/payment check run between reserve and authorize.
///
/// Called once per authorize attempt; the workflow never retries it.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `amount` is in minor currency units.
    async fn authorize(&self, customer: &CustomerId, amount: i64) -> AuthDecision;
}

/// Approves any amount up to a fixed limit.
#[derive(Debug, Clone, Copy)]
pub struct SpendingLimit {
    pub limit: i64,
}

impl SpendingLimit {
    pub fn new(limit: i64) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl Authorizer for SpendingLimit {
    async fn authorize(&self, customer: &CustomerId, amount: i64) -> AuthDecision {
        if amount <= self.limit {
            AuthDecision::Approved
        } else {
            tracing::debug!(customer = %customer, amount, limit = self.limit, "Over spending limit");
            AuthDecision::Declined
        }
    }
}
