// Key-value and sorted-set storage shared by carts, sessions and recommendations

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

/// Storage operations the storefront needs from its cache.
///
/// Plain values hold serialized carts and sessions; the scored sets hold
/// co-purchase counters.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Adds `delta` to the score of `member` in the scored set at `key`.
    async fn incr_score(&self, key: &str, member: &str, delta: f64) -> Result<(), CacheError>;

    /// Members of the union of the scored sets at `keys`, highest combined score first.
    async fn union_by_score(&self, keys: &[String]) -> Result<Vec<String>, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() > expires_at)
            .unwrap_or(false)
    }
}

/// Process-local backend used in development and tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
    scored: Arc<RwLock<HashMap<String, HashMap<String, f64>>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let store = self.store.read().await;
            match store.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.store.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.store
            .write()
            .await
            .insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.write().await.remove(key);
        self.scored.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let store = self.store.read().await;
        Ok(store.get(key).map(|e| !e.is_expired()).unwrap_or(false))
    }

    async fn incr_score(&self, key: &str, member: &str, delta: f64) -> Result<(), CacheError> {
        let mut scored = self.scored.write().await;
        *scored
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0) += delta;
        Ok(())
    }

    async fn union_by_score(&self, keys: &[String]) -> Result<Vec<String>, CacheError> {
        let scored = self.scored.read().await;
        let mut totals: HashMap<&str, f64> = HashMap::new();
        for set in keys.iter().filter_map(|k| scored.get(k)) {
            for (member, score) in set {
                *totals.entry(member.as_str()).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(&str, f64)> = totals.into_iter().collect();
        // same ordering as ZREVRANGE: score desc, then member desc
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(a.0)));
        Ok(ranked.into_iter().map(|(m, _)| m.to_string()).collect())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Redis-backed implementation sharing one multiplexed connection
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis cache connection established");
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1) as usize;
                conn.set_ex::<_, _, ()>(key, value, secs).await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn incr_score(&self, key: &str, member: &str, delta: f64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.zincr::<_, _, _, f64>(key, member, delta).await?;
        Ok(())
    }

    async fn union_by_score(&self, keys: &[String]) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        match keys {
            [] => Ok(Vec::new()),
            [single] => Ok(conn.zrevrange(single, 0, -1).await?),
            _ => {
                let tmp_key = format!("tmp_{}", keys.join("|"));
                conn.zunionstore::<_, ()>(tmp_key.clone(), keys).await?;
                let members: Vec<String> = conn.zrevrange(&tmp_key, 0, -1).await?;
                conn.del::<_, ()>(&tmp_key).await?;
                debug!(keys = keys.len(), found = members.len(), "scored union computed");
                Ok(members)
            }
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Builds the backend selected in configuration.
pub async fn create_cache(
    backend: &str,
    redis_url: &str,
) -> Result<Arc<dyn CacheBackend>, CacheError> {
    match backend.to_ascii_lowercase().as_str() {
        "redis" => Ok(Arc::new(RedisCache::connect(redis_url).await?)),
        "in-memory" => Ok(Arc::new(InMemoryCache::new())),
        other => Err(CacheError::OperationFailed(format!(
            "unknown cache backend '{}'",
            other
        ))),
    }
}
