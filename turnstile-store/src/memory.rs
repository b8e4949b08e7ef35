use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::batch::{Batch, BatchOutcome, Guard, Op};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::store::{ScanPage, Store};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Str(String),
    Bits(u32),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`Store`] with the same atomicity and TTL semantics as
/// [`crate::RedisStore`]. Expired keys are reclaimed lazily on access.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Slot>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live keys, after reclaiming expired ones.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, slot| !slot.is_expired(now));
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live<'a>(
    entries: &'a mut HashMap<String, Slot>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Slot> {
    if entries.get(key).is_some_and(|slot| slot.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

/// `None` means the TTL is too large to represent and the key never expires.
fn deadline(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

fn as_hash<'a>(slot: &'a Slot, key: &str) -> StoreResult<&'a HashMap<String, String>> {
    match &slot.value {
        Value::Hash(map) => Ok(map),
        _ => Err(StoreError::WrongType {
            key: key.to_string(),
            expected: "hash",
        }),
    }
}

fn as_bits(slot: &Slot, key: &str) -> StoreResult<u32> {
    match &slot.value {
        Value::Bits(bits) => Ok(*bits),
        _ => Err(StoreError::WrongType {
            key: key.to_string(),
            expected: "bitfield",
        }),
    }
}

fn parse_counter(key: &str, raw: Option<&String>) -> StoreResult<i64> {
    match raw {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| StoreError::WrongType {
            key: key.to_string(),
            expected: "integer field",
        }),
    }
}

/// Glob match supporting `*` and `?`, which is all the engine's patterns use.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Working copy of the keys a batch touches; committed only if every op succeeds.
struct Staged<'a> {
    entries: &'a mut HashMap<String, Slot>,
    touched: HashMap<String, Option<Slot>>,
    now: DateTime<Utc>,
}

impl<'a> Staged<'a> {
    fn slot(&mut self, key: &str) -> &mut Option<Slot> {
        let entries = &mut *self.entries;
        let now = self.now;
        self.touched
            .entry(key.to_string())
            .or_insert_with(|| live(entries, key, now).cloned())
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        let slot = self.slot(key);
        let slot = slot.get_or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Hash(map) => Ok(map),
            _ => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
        }
    }

    fn bits(&mut self, key: &str) -> StoreResult<u32> {
        match self.slot(key) {
            Some(slot) => as_bits(slot, key),
            None => Ok(0),
        }
    }

    fn put_bits(&mut self, key: &str, value: u32) {
        let slot = self.slot(key);
        match slot {
            Some(existing) => existing.value = Value::Bits(value),
            None => {
                *slot = Some(Slot {
                    value: Value::Bits(value),
                    expires_at: None,
                })
            }
        }
    }

    fn apply(&mut self, op: &Op) -> StoreResult<()> {
        match op {
            Op::HSet { key, fields } => {
                let map = self.hash_mut(key)?;
                for (field, value) in fields {
                    map.insert(field.clone(), value.clone());
                }
            }
            Op::HIncrBy {
                key, field, delta, ..
            } => {
                let map = self.hash_mut(key)?;
                let current = parse_counter(key, map.get(field))?;
                map.insert(field.clone(), (current + delta).to_string());
            }
            Op::HDel { key, fields } => {
                let slot = self.slot(key);
                if let Some(Slot {
                    value: Value::Hash(map),
                    ..
                }) = slot
                {
                    for field in fields {
                        map.remove(field);
                    }
                    if map.is_empty() {
                        *slot = None;
                    }
                }
            }
            Op::Del { key } => {
                *self.slot(key) = None;
            }
            Op::SetBits { key, value } => self.put_bits(key, *value),
            Op::OrBits { key, mask } => {
                let current = self.bits(key)?;
                self.put_bits(key, current | mask);
            }
            Op::XorBits { dest, src } => {
                let left = self.bits(dest)?;
                let right = self.bits(src)?;
                self.put_bits(dest, left ^ right);
            }
            Op::Expire { key, ttl } => {
                let at = deadline(self.now, *ttl);
                if let Some(slot) = self.slot(key) {
                    slot.expires_at = at;
                }
            }
        }
        Ok(())
    }

    fn commit(self) {
        for (key, slot) in self.touched {
            match slot {
                Some(slot) => {
                    self.entries.insert(key, slot);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            Some(slot) => Ok(as_hash(slot, key)?.clone()),
            None => Ok(HashMap::new()),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            Some(slot) => Ok(as_hash(slot, key)?.get(field).cloned()),
            None => Ok(None),
        }
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StoreResult<ScanPage> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(slot) = live(&mut entries, key, now) else {
            return Ok(ScanPage::default());
        };
        let map = as_hash(slot, key)?;

        let mut fields: Vec<&String> = map.keys().collect();
        fields.sort();

        let start = cursor as usize;
        let end = (start + count.max(1)).min(fields.len());
        let entries = fields
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|field| glob_match(pattern, field))
            .map(|field| ((*field).clone(), map[*field].clone()))
            .collect();
        let cursor = if end >= fields.len() { 0 } else { end as u64 };

        Ok(ScanPage { cursor, entries })
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key, now).is_some())
    }

    async fn get_bits(&self, key: &str) -> StoreResult<u32> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            Some(slot) => as_bits(slot, key),
            None => Ok(0),
        }
    }

    async fn bitcount(&self, key: &str) -> StoreResult<u32> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key, now) {
            Some(Slot {
                value: Value::Bits(bits),
                ..
            }) => Ok(bits.count_ones()),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(s.bytes().map(u8::count_ones).sum()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
            None => Ok(0),
        }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn execute(&self, batch: &Batch) -> StoreResult<BatchOutcome> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        for (index, guard) in batch.guards().iter().enumerate() {
            let holds = match guard {
                Guard::FieldEquals {
                    key,
                    field,
                    expected,
                } => {
                    let actual = match live(&mut entries, key, now) {
                        Some(slot) => as_hash(slot, key)?.get(field).cloned(),
                        None => None,
                    };
                    actual == *expected
                }
                Guard::BitsSet { key, mask } => {
                    let bits = match live(&mut entries, key, now) {
                        Some(slot) => as_bits(slot, key)?,
                        None => 0,
                    };
                    bits & mask == *mask
                }
            };
            if !holds {
                return Ok(BatchOutcome::GuardFailed { index });
            }
        }

        // Non-negative counters are checked against pre-batch values plus the
        // batch's own deltas, before anything is written.
        let mut pending: HashMap<(&str, &str), i64> = HashMap::new();
        for op in batch.ops() {
            if let Op::HIncrBy {
                key,
                field,
                delta,
                non_negative: true,
            } = op
            {
                let slot_key = (key.as_str(), field.as_str());
                if !pending.contains_key(&slot_key) {
                    let current = match live(&mut entries, key, now) {
                        Some(slot) => parse_counter(key, as_hash(slot, key)?.get(field))?,
                        None => 0,
                    };
                    pending.insert(slot_key, current);
                }
                let value = pending.entry(slot_key).or_default();
                *value += delta;
                if *value < 0 {
                    return Ok(BatchOutcome::NegativeCounter {
                        key: key.clone(),
                        field: field.clone(),
                    });
                }
            }
        }

        let mut staged = Staged {
            entries: &mut *entries,
            touched: HashMap::new(),
            now,
        };
        for op in batch.ops() {
            staged.apply(op)?;
        }
        staged.commit();

        Ok(BatchOutcome::Applied)
    }
}
