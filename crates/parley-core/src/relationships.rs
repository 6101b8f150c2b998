use crate::error::CoreError;
use async_trait::async_trait;
use parley_db::DbPool;
use parley_models::UserId;
use std::sync::Arc;
use std::time::Duration;

/// Social graph questions the engine needs answered.
#[async_trait]
pub trait Relationships: Send + Sync {
    /// True if either user blocked the other.
    async fn is_blocked(&self, a: UserId, b: UserId) -> Result<bool, CoreError>;

    /// Users who should see `user_id` come online or go offline.
    async fn presence_audience(&self, user_id: UserId) -> Result<Arc<Vec<UserId>>, CoreError>;
}

/// Reads the `relationships` table. Friend lists are cached briefly because
/// every connect and disconnect asks for them.
pub struct DbRelationships {
    pool: DbPool,
    audience: moka::future::Cache<UserId, Arc<Vec<UserId>>>,
}

impl DbRelationships {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            audience: moka::future::Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    /// Forget cached friend lists after the graph changed.
    pub async fn invalidate(&self, user_ids: &[UserId]) {
        for id in user_ids {
            self.audience.invalidate(id).await;
        }
    }
}

#[async_trait]
impl Relationships for DbRelationships {
    async fn is_blocked(&self, a: UserId, b: UserId) -> Result<bool, CoreError> {
        Ok(parley_db::relationships::is_blocked_either(&self.pool, a, b).await?)
    }

    async fn presence_audience(&self, user_id: UserId) -> Result<Arc<Vec<UserId>>, CoreError> {
        if let Some(cached) = self.audience.get(&user_id).await {
            return Ok(cached);
        }
        let friends = Arc::new(
            parley_db::relationships::get_friend_user_ids(&self.pool, user_id).await?,
        );
        self.audience.insert(user_id, friends.clone()).await;
        Ok(friends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_pool;
    use chrono::Utc;
    use parley_db::relationships::{set_relationship, RelationshipKind};

    #[tokio::test]
    async fn audience_is_cached_until_invalidated() {
        let pool = memory_pool().await;
        let rel = DbRelationships::new(pool.clone());
        set_relationship(&pool, 1, 2, RelationshipKind::Friend, Utc::now())
            .await
            .unwrap();
        assert_eq!(*rel.presence_audience(1).await.unwrap(), vec![2]);

        set_relationship(&pool, 1, 3, RelationshipKind::Friend, Utc::now())
            .await
            .unwrap();
        assert_eq!(*rel.presence_audience(1).await.unwrap(), vec![2]);
        rel.invalidate(&[1]).await;
        assert_eq!(*rel.presence_audience(1).await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn blocks_are_never_cached() {
        let pool = memory_pool().await;
        let rel = DbRelationships::new(pool.clone());
        assert!(!rel.is_blocked(1, 2).await.unwrap());
        set_relationship(&pool, 2, 1, RelationshipKind::Blocked, Utc::now())
            .await
            .unwrap();
        assert!(rel.is_blocked(1, 2).await.unwrap());
    }
}
