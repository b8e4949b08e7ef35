pub mod events;
pub mod payment;
pub mod workflow;

pub use events::{FailReason, PurchaseEvent};
pub use payment::{AuthDecision, Authorizer, SpendingLimit};
pub use workflow::{AuthorizeOutcome, CompleteOutcome, PurchaseRequest, PurchaseWorkflow};
