use crate::cache::{CacheBackend, CacheError};
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tower_sessions::{
    session::{Id, Record},
    session_store, SessionStore,
};

/// Session records kept in the shared cache under `session:{id}`, expiring
/// with the record itself.
#[derive(Clone)]
pub struct CacheSessionStore {
    cache: Arc<dyn CacheBackend>,
}

impl CacheSessionStore {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }

    fn key(id: &Id) -> String {
        format!("session:{}", id)
    }

    fn remaining_lifetime(record: &Record) -> Duration {
        let secs = record.expiry_date.unix_timestamp() - Utc::now().timestamp();
        Duration::from_secs(secs.max(1) as u64)
    }
}

impl fmt::Debug for CacheSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSessionStore").finish_non_exhaustive()
    }
}

fn backend(err: CacheError) -> session_store::Error {
    session_store::Error::Backend(err.to_string())
}

#[async_trait]
impl SessionStore for CacheSessionStore {
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        while self
            .cache
            .exists(&Self::key(&record.id))
            .await
            .map_err(backend)?
        {
            record.id = Id::default();
        }
        self.save(record).await
    }

    async fn save(&self, record: &Record) -> session_store::Result<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| session_store::Error::Encode(e.to_string()))?;
        self.cache
            .set(
                &Self::key(&record.id),
                &raw,
                Some(Self::remaining_lifetime(record)),
            )
            .await
            .map_err(backend)
    }

    async fn load(&self, id: &Id) -> session_store::Result<Option<Record>> {
        match self.cache.get(&Self::key(id)).await.map_err(backend)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| session_store::Error::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &Id) -> session_store::Result<()> {
        self.cache.delete(&Self::key(id)).await.map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use std::collections::HashMap;
    use time::{Duration as CookieDuration, OffsetDateTime};

    fn record(lifetime: CookieDuration) -> Record {
        Record {
            id: Id::default(),
            data: HashMap::from([("coupon_id".to_string(), serde_json::json!("c-1"))]),
            expiry_date: OffsetDateTime::now_utc() + lifetime,
        }
    }

    #[tokio::test]
    async fn saved_records_load_until_deleted() {
        let cache = Arc::new(InMemoryCache::new());
        let store = CacheSessionStore::new(cache.clone());
        let mut rec = record(CookieDuration::hours(1));

        store.create(&mut rec).await.unwrap();
        assert!(cache.exists(&format!("session:{}", rec.id)).await.unwrap());

        let loaded = store.load(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, rec.data);

        store.delete(&rec.id).await.unwrap();
        assert!(store.load(&rec.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_never_overwrites_an_existing_session() {
        let store = CacheSessionStore::new(Arc::new(InMemoryCache::new()));
        let mut first = record(CookieDuration::hours(1));
        store.create(&mut first).await.unwrap();

        let mut second = record(CookieDuration::hours(1));
        second.id = first.id;
        store.create(&mut second).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(store.load(&first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn record_expires_with_its_expiry_date() {
        let store = CacheSessionStore::new(Arc::new(InMemoryCache::new()));
        let mut rec = record(CookieDuration::seconds(-5));
        store.create(&mut rec).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.load(&rec.id).await.unwrap().is_none());
    }
}
