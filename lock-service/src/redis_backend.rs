//! Redis-backed [`LockBackend`] using `SET NX EX` for acquisition and a Lua
//! compare-and-delete script for release, so a worker can never delete a lock it
//! no longer holds (e.g. one whose lease already expired and was re-acquired by
//! another worker).

use crate::{LockBackend, LockError};
use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use std::time::Duration;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub struct RedisLockBackend {
    client: Client,
}

impl RedisLockBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("EX")
            .arg(lease.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(acquired.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        conn.exists(key)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}
