//! Named distributed lock with TTL, backing the HA leader-election note in
//! the design: acquire with `SET NX PX`, renew at < 50% of TTL, release on
//! shutdown. Only the lock holder runs the Auto-Scaler and cleanup sweepers.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

pub struct DistributedLock {
    kv: ConnectionManager,
    key: String,
    holder_token: String,
    ttl: Duration,
}

impl DistributedLock {
    pub fn new(kv: ConnectionManager, key: impl Into<String>, holder_token: impl Into<String>, ttl: Duration) -> Self {
        Self { kv, key: key.into(), holder_token: holder_token.into(), ttl }
    }

    /// Attempts to acquire the lock; returns `true` if acquired or already
    /// held by this token.
    pub async fn try_acquire(&mut self) -> Result<bool> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.holder_token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut self.kv)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(acquired.is_some())
    }

    /// Renews the TTL iff this token currently holds the lock. Callers
    /// should renew at < 50% of the configured TTL.
    pub async fn renew(&mut self) -> Result<bool> {
        const SCRIPT: &str = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("pexpire", KEYS[1], ARGV[2])
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(SCRIPT)
            .key(&self.key)
            .arg(&self.holder_token)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut self.kv)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(result == 1)
    }

    pub async fn release(&mut self) -> Result<()> {
        const SCRIPT: &str = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
        "#;

        redis::Script::new(SCRIPT)
            .key(&self.key)
            .arg(&self.holder_token)
            .invoke_async::<_, i32>(&mut self.kv)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        Ok(())
    }

    pub async fn is_held_by_this_token(&mut self) -> Result<bool> {
        let current: Option<String> = self
            .kv
            .get(&self.key)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(current.as_deref() == Some(self.holder_token.as_str()))
    }
}
