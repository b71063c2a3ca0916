//! Redis-backed [`LockManager`], for running several processes against one store.
//!
//! Acquire is `SET key token NX PX ttl`; release is a compare-and-delete script so a
//! holder whose lease already lapsed cannot clear someone else's lock.

use crate::domain::ports::LockManager;
use crate::error::Result;
use async_trait::async_trait;
use redis::{Client, Script, aio::ConnectionManager};
use std::time::Duration;
use tracing::info;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockManager {
    conn: ConnectionManager,
    key_prefix: String,
    release: Script,
}

impl RedisLockManager {
    /// Connects to `url` (e.g. `redis://localhost:6379`). Keys are stored as `{prefix}:lock:{key}`.
    pub async fn new(url: &str, key_prefix: Option<&str>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for locks");

        Ok(Self {
            conn,
            key_prefix: key_prefix.unwrap_or("portal").to_string(),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(self.lock_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
