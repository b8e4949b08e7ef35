pub mod app_config;
pub mod batch;
pub mod clock;
pub mod error;
pub mod memory;
pub mod redis_repo;
pub mod store;

pub use batch::{Batch, BatchOutcome, Guard, Op};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_repo::RedisStore;
pub use store::{ScanPage, Store};
