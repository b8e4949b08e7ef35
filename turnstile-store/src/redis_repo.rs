use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::batch::{Batch, BatchOutcome};
use crate::error::{StoreError, StoreResult};
use crate::store::{ScanPage, Store};

// Interprets an encoded Batch (see Batch::encode). Guards are checked first,
// then non-negative counters, and only then is anything written, so a
// rejected batch leaves every key untouched.
const EXECUTE_BATCH_LUA: &str = r#"
local pos = 1
local function take()
    local value = ARGV[pos]
    pos = pos + 1
    return value
end

local function read_u32(key)
    return redis.call('BITFIELD', key, 'GET', 'u32', 0)[1]
end

local function to_u32(value)
    if value < 0 then
        return value + 4294967296
    end
    return value
end

local guard_count = tonumber(take())
for index = 1, guard_count do
    local kind = take()
    local key = KEYS[tonumber(take())]
    if kind == 'feq' then
        local field = take()
        local present = take()
        local expected = take()
        local actual = redis.call('HGET', key, field)
        if present == '1' then
            if actual ~= expected then
                return {'guard', tostring(index - 1)}
            end
        elseif actual then
            return {'guard', tostring(index - 1)}
        end
    elseif kind == 'bits' then
        local mask = tonumber(take())
        if bit.band(read_u32(key), mask) ~= bit.tobit(mask) then
            return {'guard', tostring(index - 1)}
        end
    end
end

local op_count = tonumber(take())
local ops_start = pos
local pending = {}
for _ = 1, op_count do
    local kind = take()
    local key_index = take()
    if kind == 'hset' then
        pos = pos + 2 * tonumber(take())
    elseif kind == 'hincr' then
        local field = take()
        local delta = tonumber(take())
        if take() == '1' then
            local slot = key_index .. '\n' .. field
            if pending[slot] == nil then
                pending[slot] = tonumber(redis.call('HGET', KEYS[tonumber(key_index)], field) or '0')
            end
            pending[slot] = pending[slot] + delta
            if pending[slot] < 0 then
                return {'negative', KEYS[tonumber(key_index)], field}
            end
        end
    elseif kind == 'hdel' then
        pos = pos + tonumber(take())
    elseif kind ~= 'del' then
        pos = pos + 1
    end
end

pos = ops_start
for _ = 1, op_count do
    local kind = take()
    local key = KEYS[tonumber(take())]
    if kind == 'hset' then
        local n = tonumber(take())
        for _ = 1, n do
            local field = take()
            redis.call('HSET', key, field, take())
        end
    elseif kind == 'hincr' then
        local field = take()
        local delta = take()
        take()
        redis.call('HINCRBY', key, field, delta)
    elseif kind == 'hdel' then
        local n = tonumber(take())
        for _ = 1, n do
            redis.call('HDEL', key, take())
        end
    elseif kind == 'del' then
        redis.call('DEL', key)
    elseif kind == 'setbits' then
        redis.call('BITFIELD', key, 'SET', 'u32', 0, take())
    elseif kind == 'orbits' then
        local mask = tonumber(take())
        redis.call('BITFIELD', key, 'SET', 'u32', 0, to_u32(bit.bor(read_u32(key), mask)))
    elseif kind == 'xor' then
        local src = KEYS[tonumber(take())]
        redis.call('BITOP', 'XOR', key, key, src)
    elseif kind == 'expire' then
        redis.call('EXPIRE', key, take())
    end
end

return {'ok'}
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    execute_script: Arc<redis::Script>,
}

impl RedisStore {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis at {}", connection_string);
        Ok(Self {
            conn,
            execute_script: Arc::new(redis::Script::new(EXECUTE_BATCH_LUA)),
        })
    }

    fn parse_outcome(reply: Vec<String>) -> StoreResult<BatchOutcome> {
        match reply.as_slice() {
            [status] if status == "ok" => Ok(BatchOutcome::Applied),
            [status, index] if status == "guard" => {
                let index = index
                    .parse()
                    .map_err(|_| StoreError::MalformedReply(format!("guard index {index}")))?;
                Ok(BatchOutcome::GuardFailed { index })
            }
            [status, key, field] if status == "negative" => Ok(BatchOutcome::NegativeCounter {
                key: key.clone(),
                field: field.clone(),
            }),
            other => Err(StoreError::MalformedReply(format!("{other:?}"))),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StoreResult<ScanPage> {
        let mut conn = self.conn.clone();
        let (cursor, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(key)
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            entries.push((field, value));
        }
        Ok(ScanPage { cursor, entries })
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn get_bits(&self, key: &str) -> StoreResult<u32> {
        let mut conn = self.conn.clone();
        let values: Vec<i64> = redis::cmd("BITFIELD")
            .arg(key)
            .arg("GET")
            .arg("u32")
            .arg(0)
            .query_async(&mut conn)
            .await?;
        let raw = values
            .first()
            .copied()
            .ok_or_else(|| StoreError::MalformedReply(format!("empty BITFIELD reply for {key}")))?;
        u32::try_from(raw).map_err(|_| StoreError::MalformedReply(format!("u32 out of range: {raw}")))
    }

    async fn bitcount(&self, key: &str) -> StoreResult<u32> {
        let mut conn = self.conn.clone();
        let count: u32 = redis::cmd("BITCOUNT").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();

        // SET NX: Only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn execute(&self, batch: &Batch) -> StoreResult<BatchOutcome> {
        let mut conn = self.conn.clone();
        let (keys, args) = batch.encode();

        let mut invocation = self.execute_script.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        for arg in &args {
            invocation.arg(arg);
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        let outcome = Self::parse_outcome(reply)?;
        debug!(keys = keys.len(), ?outcome, "batch executed");
        Ok(outcome)
    }
}
