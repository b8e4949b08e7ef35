pub mod bitset;
pub mod holds;
pub mod ledger;
pub mod seats;
pub mod setup;

pub use bitset::{BitsetBlock, FreeRuns};
pub use holds::{HoldManager, HoldRequest};
pub use ledger::InventoryLedger;
pub use seats::{AllocationStrategy, BestFit, BlockState, FirstFit, SeatAllocator, SeatReservation};
pub use setup::TierSpec;
