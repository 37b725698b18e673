use async_trait::async_trait;

use super::{CacheError, CacheHealth, SessionStore};
use crate::core::redis::{RedisHandle, RedisHealth};

const KEY_PREFIX: &str = "exam_session:";
const INDEX_KEY: &str = "exam_sessions";

/// Stores each record under `exam_session:{id}` and tracks ids in a set.
pub(crate) struct RedisStore {
    redis: RedisHandle,
}

impl RedisStore {
    pub(crate) fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }
}

fn key_for(session_id: &str) -> String {
    format!("{KEY_PREFIX}{session_id}")
}

#[async_trait]
impl SessionStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn read(&self, session_id: &str) -> Result<Option<String>, CacheError> {
        Ok(self.redis.get(&key_for(session_id)).await?)
    }

    async fn write(&self, session_id: &str, payload: &str) -> Result<(), CacheError> {
        Ok(self.redis.set_indexed(&key_for(session_id), payload, INDEX_KEY, session_id).await?)
    }

    async fn remove(&self, session_id: &str) -> Result<(), CacheError> {
        Ok(self.redis.del_indexed(&key_for(session_id), INDEX_KEY, session_id).await?)
    }

    async fn list(&self) -> Result<Vec<String>, CacheError> {
        let mut ids = self.redis.members(INDEX_KEY).await?;
        ids.sort();
        Ok(ids)
    }

    async fn health(&self) -> CacheHealth {
        match self.redis.health().await {
            RedisHealth::Healthy => CacheHealth::Healthy,
            RedisHealth::Disconnected => CacheHealth::Unavailable("disconnected".to_string()),
            RedisHealth::Unhealthy(reason) => CacheHealth::Unavailable(reason),
        }
    }
}
