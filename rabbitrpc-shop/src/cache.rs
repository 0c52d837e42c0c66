use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CacheResult;

/// Expiring key/value cache. A miss is always safe; callers treat errors as
/// misses.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;
}

pub type CachePtr = Arc<dyn Cache>;

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> CachePtr {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if *expires_at > now {
                return Ok(Some(value.clone()));
            }
        }
        // expired
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("user:u1", "{}".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(cache.get("user:u1").await.unwrap().as_deref(), Some("{}"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("user:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
