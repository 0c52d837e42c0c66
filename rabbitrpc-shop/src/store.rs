use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::contracts::{Order, Product, User};
use crate::error::StoreResult;

/// A stored document with a string id
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

impl Entity for Product {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for User {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Order {
    fn id(&self) -> &str {
        &self.id
    }
}

/// In-place modification applied by [`Repository::update_by_id`]
pub type Update<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Document store boundary used by the services
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<T>>;

    async fn find_all(&self) -> StoreResult<Vec<T>>;

    /// Insert or replace by id
    async fn save(&self, entity: T) -> StoreResult<T>;

    /// Apply `update` and return the new document, `None` if absent
    async fn update_by_id(&self, id: &str, update: Update<T>) -> StoreResult<Option<T>>;

    /// Remove and return the document, `None` if absent
    async fn delete_by_id(&self, id: &str) -> StoreResult<Option<T>>;
}

/// Shared handle to a repository
pub type RepositoryPtr<T> = Arc<dyn Repository<T>>;

/// In-process store keyed by id
#[derive(Debug)]
pub struct MemoryRepository<T> {
    documents: DashMap<String, T>,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
        }
    }

    pub fn shared() -> RepositoryPtr<T> {
        Arc::new(Self::new())
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<T>> {
        Ok(self.documents.get(id).map(|doc| doc.value().clone()))
    }

    async fn find_all(&self) -> StoreResult<Vec<T>> {
        Ok(self
            .documents
            .iter()
            .map(|doc| doc.value().clone())
            .collect())
    }

    async fn save(&self, entity: T) -> StoreResult<T> {
        self.documents
            .insert(entity.id().to_string(), entity.clone());
        Ok(entity)
    }

    async fn update_by_id(&self, id: &str, update: Update<T>) -> StoreResult<Option<T>> {
        Ok(self.documents.get_mut(id).map(|mut doc| {
            update(doc.value_mut());
            doc.value().clone()
        }))
    }

    async fn delete_by_id(&self, id: &str) -> StoreResult<Option<T>> {
        Ok(self.documents.remove(id).map(|(_, doc)| doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::OrderStatus;
    use chrono::Utc;

    fn order(id: &str, quantity: u32) -> Order {
        Order {
            id: id.to_string(),
            product_id: "p1".to_string(),
            user_id: "u1".to_string(),
            quantity,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_crud() {
        let repo = MemoryRepository::new();
        repo.save(order("o1", 2)).await.unwrap();

        assert_eq!(repo.find_by_id("o1").await.unwrap().unwrap().quantity, 2);
        assert!(repo.find_by_id("o2").await.unwrap().is_none());

        let updated = repo
            .update_by_id("o1", Box::new(|o: &mut Order| o.quantity = 5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.quantity, 5);
        assert!(repo
            .update_by_id("missing", Box::new(|o: &mut Order| o.quantity = 1))
            .await
            .unwrap()
            .is_none());

        assert_eq!(repo.find_all().await.unwrap().len(), 1);
        assert!(repo.delete_by_id("o1").await.unwrap().is_some());
        assert!(repo.delete_by_id("o1").await.unwrap().is_none());
    }
}
