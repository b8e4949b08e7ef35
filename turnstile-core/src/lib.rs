pub mod error;
pub mod ids;
pub mod keys;
pub mod models;
pub mod retry;

pub use error::{InventoryError, InventoryResult};
pub use ids::{BlockLabel, CustomerId, EventSku, OrderId, Tier};
pub use keys::KeySpace;
pub use models::{Hold, HoldId, Purchase, PurchaseState, SeatRun, TierSnapshot};
pub use retry::{retry_on_conflict, RetryPolicy};
