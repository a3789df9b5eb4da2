// ===============================
// src/lock.rs
// ===============================
//
// Key-scoped mutual exclusion with TTL expiry, shared across process
// instances.
//
// - NoopLock   : single instance, every call succeeds
// - MemoryLock : in-process store, same token/TTL rules as redis
// - RedisLock  : SET NX PX + compare-and-delete / compare-and-pexpire scripts
//
// Each acquisition gets a fresh token; release and extend only touch the key
// while it still holds our token, so a sibling can never free a lock it does
// not own, and a crashed holder's lock simply expires.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::backoff::Backoff;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self { LockError::Backend(e.to_string()) }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Non-blocking. `Ok(false)` means someone else holds the key.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release, only if we still own the key. Returns whether a release happened.
    async fn unlock(&self, key: &str) -> Result<bool, LockError>;

    /// Push the expiry out, only if we still own the key.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Blocks (polling with backoff) until acquired. Cancel by dropping the future.
    async fn lock(&self, key: &str, ttl: Duration) -> Result<(), LockError> {
        let mut backoff = Backoff::new(Duration::from_millis(20), Duration::from_millis(500), 0.2);
        loop {
            if self.try_lock(key, ttl).await? {
                return Ok(());
            }
            let wait = backoff.next_delay();
            debug!(key, attempt = backoff.attempt(), wait_ms = wait.as_millis() as u64, "lock busy, waiting");
            sleep(wait).await;
        }
    }
}

fn new_token() -> String { uuid::Uuid::new_v4().simple().to_string() }

// -----------------------------------------------------------------------------
// Single instance
// -----------------------------------------------------------------------------
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

#[async_trait]
impl DistributedLock for NoopLock {
    async fn try_lock(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> { Ok(true) }
    async fn unlock(&self, _key: &str) -> Result<bool, LockError> { Ok(true) }
    async fn extend(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> { Ok(true) }
    async fn lock(&self, _key: &str, _ttl: Duration) -> Result<(), LockError> { Ok(()) }
}

// -----------------------------------------------------------------------------
// In-process store
// -----------------------------------------------------------------------------
#[derive(Debug)]
struct Entry { token: String, expires_at: Instant }

type MemoryLockStore = Arc<Mutex<HashMap<String, Entry>>>;

/// One handle per "instance". Handles created with [`MemoryLock::sibling`]
/// share the store but not the tokens.
#[derive(Debug, Clone)]
pub struct MemoryLock {
    store: MemoryLockStore,
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl Default for MemoryLock {
    fn default() -> Self { Self::new() }
}

impl MemoryLock {
    pub fn new() -> Self {
        Self { store: Arc::new(Mutex::new(HashMap::new())), held: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Another instance contending on the same keys
    pub fn sibling(&self) -> Self {
        Self { store: self.store.clone(), held: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let store = self.store.lock();
        store.get(key).map(|e| e.expires_at > Instant::now()).unwrap_or(false)
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut store = self.store.lock();
        if let Some(e) = store.get(key) {
            if e.expires_at > now {
                return Ok(false);
            }
        }
        let token = new_token();
        store.insert(key.to_string(), Entry { token: token.clone(), expires_at: now + ttl });
        drop(store);
        self.held.lock().insert(key.to_string(), token);
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<bool, LockError> {
        let Some(token) = self.held.lock().remove(key) else { return Ok(false) };
        let mut store = self.store.lock();
        match store.get(key) {
            Some(e) if e.token == token => {
                store.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let Some(token) = self.held.lock().get(key).cloned() else { return Ok(false) };
        let now = Instant::now();
        let mut store = self.store.lock();
        match store.get_mut(key) {
            Some(e) if e.token == token && e.expires_at > now => {
                e.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// -----------------------------------------------------------------------------
// Redis
// -----------------------------------------------------------------------------
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLock {
    conn: ConnectionManager,
    prefix: String,
    held: Mutex<HashMap<String, String>>,
    unlock_script: redis::Script,
    extend_script: redis::Script,
}

impl RedisLock {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            held: Mutex::new(HashMap::new()),
            unlock_script: redis::Script::new(UNLOCK_SCRIPT),
            extend_script: redis::Script::new(EXTEND_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String { format!("{}:{}", self.prefix, key) }
}

fn ttl_ms(ttl: Duration) -> u64 { (ttl.as_millis() as u64).max(1) }

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let token = new_token();
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        if reply.is_some() {
            self.held.lock().insert(key.to_string(), token);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn unlock(&self, key: &str) -> Result<bool, LockError> {
        let Some(token) = self.held.lock().remove(key) else { return Ok(false) };
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock_script
            .key(self.full_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            warn!(key, "lock expired before release");
        }
        Ok(deleted == 1)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let Some(token) = self.held.lock().get(key).cloned() else { return Ok(false) };
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .extend_script
            .key(self.full_key(key))
            .arg(token)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(ok == 1)
    }
}
