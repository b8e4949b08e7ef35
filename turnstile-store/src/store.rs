use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::batch::{Batch, BatchOutcome};
use crate::error::StoreResult;

/// One page of an HSCAN-style iteration. A `cursor` of 0 means the scan is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub entries: Vec<(String, String)>,
}

/// The key-value store the engine runs against.
///
/// Reads are single commands. Every write goes through [`Store::execute`],
/// which applies a guarded [`Batch`] with no interleaving from other callers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Page through the fields of a hash whose names match a glob `pattern`.
    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StoreResult<ScanPage>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// BITFIELD key GET u32 0. A missing key reads as 0.
    async fn get_bits(&self, key: &str) -> StoreResult<u32>;

    async fn bitcount(&self, key: &str) -> StoreResult<u32>;

    /// SET key value NX EX ttl. Returns true if the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn execute(&self, batch: &Batch) -> StoreResult<BatchOutcome>;
}
