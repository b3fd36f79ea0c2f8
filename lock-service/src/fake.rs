//! In-memory [`LockBackend`] for unit tests.

use crate::{LockBackend, LockError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLockBackend {
    locks: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().expect("in-memory lock backend poisoned");
        let now = Instant::now();
        if let Some(entry) = locks.get(key) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().expect("in-memory lock backend poisoned");
        if let Some(entry) = locks.get(key) {
            if entry.token == token {
                locks.remove(key);
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let locks = self.locks.lock().expect("in-memory lock backend poisoned");
        Ok(locks
            .get(key)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false))
    }
}
