use chrono::Utc;
use rabbitrpc::{ExchangeRegistry, RabbitRpcError, Result, Service};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CachePtr;
use crate::contracts::{NewUser, User, USER_EXCHANGE, USER_GET};
use crate::error::{CacheError, StoreError};
use crate::store::RepositoryPtr;

pub const SERVICE_NAME: &str = "user-service";

/// How long `user.get` results stay cached
pub const USER_CACHE_TTL: Duration = Duration::from_secs(7200);

fn cache_key(id: &str) -> String {
    format!("user:{}", id)
}

/// Owns user records and serves `user.get`
pub struct UserService {
    users: RepositoryPtr<User>,
    cache: CachePtr,
    ttl: Duration,
}

impl UserService {
    pub fn new(users: RepositoryPtr<User>, cache: CachePtr) -> Self {
        Self {
            users,
            cache,
            ttl: USER_CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn registry() -> Result<ExchangeRegistry> {
        ExchangeRegistry::builder().owns(USER_EXCHANGE).build()
    }

    pub fn bind(self: &Arc<Self>, service: &mut Service) -> Result<()> {
        let users = self.clone();
        service.respond(USER_GET, USER_EXCHANGE, USER_GET, move |id: String| {
            let users = users.clone();
            async move { users.get_user_by_id(&id).await }
        })?;
        Ok(())
    }

    /// Create a user; username and email are unique
    pub async fn create(&self, input: NewUser) -> Result<User> {
        if input.username.trim().is_empty() || !input.email.contains('@') {
            return Err(RabbitRpcError::invalid("a username and a valid email are required"));
        }

        let existing = self.users.find_all().await?;
        if existing.iter().any(|u| u.username == input.username) {
            return Err(StoreError::Duplicate {
                field: "username",
                value: input.username,
            }
            .into());
        }
        if existing.iter().any(|u| u.email == input.email) {
            return Err(StoreError::Duplicate {
                field: "email",
                value: input.email,
            }
            .into());
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            username: input.username,
            email: input.email,
            created_at: Utc::now(),
        };
        let user = self.users.save(user).await?;
        info!("Created user: {} (ID: {})", user.username, user.id);
        Ok(user)
    }

    /// Read-through lookup. Cache failures never fail the caller.
    pub async fn get_user_by_id(&self, id: &str) -> Result<User> {
        let key = cache_key(id);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<User>(&cached) {
                Ok(user) => {
                    debug!("Cache hit for {}", key);
                    return Ok(user);
                }
                Err(e) => {
                    let err = CacheError::Corrupt {
                        key: key.clone(),
                        reason: e.to_string(),
                    };
                    warn!("Ignoring cache entry: {}", err);
                }
            },
            Ok(None) => {}
            Err(e) => warn!("Cache lookup failed for {}: {}", key, e),
        }

        let user = self
            .users
            .find_by_id(id)
            .await?
            .ok_or_else(|| RabbitRpcError::not_found("User not found"))?;

        match serde_json::to_string(&user) {
            Ok(value) => {
                if let Err(e) = self.cache.set(&key, value, self.ttl).await {
                    warn!("Cache write failed for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Could not encode user {} for caching: {}", id, e),
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::error::CacheResult;
    use crate::store::{MemoryRepository, Repository};
    use async_trait::async_trait;

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    fn alice() -> NewUser {
        NewUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_lookup_populates_cache() {
        let cache = Arc::new(MemoryCache::new());
        let users = UserService::new(MemoryRepository::shared(), cache.clone());
        let created = users.create(alice()).await.unwrap();

        let fetched = users.get_user_by_id(&created.id).await.unwrap();
        assert_eq!(fetched, created);

        let cached = cache.get(&cache_key(&created.id)).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<User>(&cached).unwrap(), created);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_store() {
        let repo = Arc::new(MemoryRepository::<User>::new());
        let users = UserService::new(repo.clone(), MemoryCache::shared());
        let created = users.create(alice()).await.unwrap();
        users.get_user_by_id(&created.id).await.unwrap();

        repo.delete_by_id(&created.id).await.unwrap();
        assert_eq!(users.get_user_by_id(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_broken_cache_is_ignored() {
        let users = UserService::new(MemoryRepository::shared(), Arc::new(BrokenCache));
        let created = users.create(alice()).await.unwrap();
        assert_eq!(users.get_user_by_id(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_falls_back_to_store() {
        let cache = Arc::new(MemoryCache::new());
        let users = UserService::new(MemoryRepository::shared(), cache.clone());
        let created = users.create(alice()).await.unwrap();

        let key = cache_key(&created.id);
        cache
            .set(&key, "{not json".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(users.get_user_by_id(&created.id).await.unwrap(), created);
        let rewritten = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<User>(&rewritten).unwrap(), created);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let users = UserService::new(MemoryRepository::shared(), MemoryCache::shared());
        let err = users.get_user_by_id("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.reply_message(), "User not found");
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let users = UserService::new(MemoryRepository::shared(), MemoryCache::shared());
        users.create(alice()).await.unwrap();
        let err = users
            .create(NewUser {
                email: "other@example.com".to_string(),
                ..alice()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }
}
