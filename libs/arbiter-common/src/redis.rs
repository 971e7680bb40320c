use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::store::CoordinationStore;

/// Redis key semantics - every worker, and the CLI, must agree on these
/// so the slot counter and heartbeats are shared fleet-wide.

pub const SLOTS_USED_KEY: &str = "arbiter:slots:used";
pub const SLOTS_LIMIT_KEY: &str = "arbiter:slots:limit";
pub const SESSION_PREFIX: &str = "arbiter:session:";

/// Heartbeat key for a session
pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

/// Inverse of [`session_key`]
pub fn session_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(SESSION_PREFIX).filter(|id| !id.is_empty())
}

const INCREMENT_BOUNDED: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(redis.call('GET', KEYS[2]) or '0')
if used < limit then
    redis.call('INCR', KEYS[1])
    if KEYS[3] then
        redis.call('SET', KEYS[3], ARGV[1])
    end
    return 1
end
return 0
"#;

const DECREMENT_FLOORED: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
if used > 0 then
    return redis.call('DECR', KEYS[1])
end
redis.call('SET', KEYS[1], 0)
return 0
"#;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Coordination store backed by Redis.
///
/// Conditional mutations run as Lua scripts, which Redis executes
/// atomically, so the bound check and the increment can never interleave
/// with another worker's.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment_bounded: Script,
    decrement_floored: Script,
    compare_and_delete: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_bounded: Script::new(INCREMENT_BOUNDED),
            decrement_floored: Script::new(DECREMENT_FLOORED),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn increment_bounded(
        &self,
        counter_key: &str,
        limit_key: &str,
        holder: Option<(&str, &str)>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.increment_bounded.key(counter_key);
        invocation.key(limit_key);
        if let Some((key, value)) = holder {
            invocation.key(key).arg(value);
        }
        let acquired: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(acquired == 1)
    }

    async fn decrement_floored(&self, counter_key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let used: i64 = self
            .decrement_floored
            .key(counter_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(used)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}
