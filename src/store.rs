//! Durable key/value state store
//!
//! One interface, two implementations: [`RedisStore`] for durable remote
//! state and [`MemoryStore`] as the local/ephemeral fallback. The memory
//! store is a production implementation in its own right (single-process
//! deployments), not a test double.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;

/// State store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Key/value storage with TTL, set membership, and lease-based locks.
///
/// The lock primitive is the only cross-process mutual exclusion mechanism
/// in the system: `acquire_lock` returns a token that must be presented to
/// `release_lock`, and the lease expires on its own after `ttl_ms`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn set_add(&self, set: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError>;

    /// Try to take a lease on `resource`; `None` when it is already held
    async fn acquire_lock(
        &self,
        resource: &str,
        ttl_ms: u64,
    ) -> Result<Option<String>, StoreError>;

    /// Release a lease; true when the token still held the lock
    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, BTreeSet<String>>,
    locks: HashMap<String, (String, Instant)>,
}

/// Local/ephemeral store for single-process deployments and tests
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    fn prune(&self, state: &mut MemoryState) {
        let now = self.clock.now();
        state
            .values
            .retain(|_, (_, expiry)| expiry.map(|at| at > now).unwrap_or(true));
        state.locks.retain(|_, (_, expiry)| *expiry > now);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock();
        self.prune(&mut state);
        Ok(state.values.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expiry = ttl.map(|d| self.clock.now() + d);
        self.state
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().values.remove(key);
        Ok(())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), StoreError> {
        if let Some(members) = self.state.lock().sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .sets
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        ttl_ms: u64,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock();
        self.prune(&mut state);
        if state.locks.contains_key(resource) {
            return Ok(None);
        }
        let token = Uuid::new_v4().simple().to_string();
        let expiry = self.clock.now() + Duration::from_millis(ttl_ms);
        state
            .locks
            .insert(resource.to_string(), (token.clone(), expiry));
        Ok(Some(token))
    }

    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.locks.get(resource) {
            Some((held, _)) if held == token => {
                state.locks.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Redis implementation

/// Durable remote store backed by redis
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    /// Key prefix so several orchestrators can share one redis
    namespace: String,
}

impl RedisStore {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: namespace.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(self.key(set))
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SREM")
            .arg(self.key(set))
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(set))
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        ttl_ms: u64,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().simple().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(&format!("lock:{resource}")))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool, StoreError> {
        // GET and DEL must be atomic: a lapsed lease may already belong to
        // another holder
        const RELEASE: &str = r#"
            if redis.call('get', KEYS[1]) == ARGV[1] then
                return redis.call('del', KEYS[1])
            else
                return 0
            end"#;
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE)
            .key(self.key(&format!("lock:{resource}")))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn memory_store() -> (MemoryStore, FakeClock) {
        let clock = FakeClock::new();
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let (store, _clock) = memory_store();

        store.set("job:1", "{}", None).await.unwrap();
        assert_eq!(store.get("job:1").await.unwrap(), Some("{}".to_string()));

        store.delete("job:1").await.unwrap();
        assert_eq!(store.get("job:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expires_values() {
        let (store, clock) = memory_store();

        store
            .set("ephemeral", "x", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(store.get("ephemeral").await.unwrap().is_some());

        clock.advance(Duration::from_secs(11));
        assert!(store.get("ephemeral").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_membership() {
        let (store, _clock) = memory_store();

        store.set_add("jobs", "a").await.unwrap();
        store.set_add("jobs", "b").await.unwrap();
        store.set_add("jobs", "a").await.unwrap();

        let members = store.set_members("jobs").await.unwrap();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        store.set_remove("jobs", "a").await.unwrap();
        assert_eq!(store.set_members("jobs").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let (store, _clock) = memory_store();

        let token = store.acquire_lock("job:1", 5000).await.unwrap().unwrap();
        assert!(store.acquire_lock("job:1", 5000).await.unwrap().is_none());

        assert!(store.release_lock("job:1", &token).await.unwrap());
        assert!(store.acquire_lock("job:1", 5000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_lease_expires() {
        let (store, clock) = memory_store();

        let _token = store.acquire_lock("job:1", 1000).await.unwrap().unwrap();
        clock.advance(Duration::from_millis(1500));

        // Lease lapsed, a new holder can acquire
        assert!(store.acquire_lock("job:1", 1000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_noop() {
        let (store, _clock) = memory_store();

        let _token = store.acquire_lock("job:1", 5000).await.unwrap().unwrap();
        assert!(!store.release_lock("job:1", "forged").await.unwrap());
        assert!(store.acquire_lock("job:1", 5000).await.unwrap().is_none());
    }
}
