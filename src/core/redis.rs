use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{cmd, Client, ErrorKind, RedisError};
use tokio::sync::RwLock;

#[derive(Clone)]
pub(crate) struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub(crate) fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub(crate) async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    pub(crate) async fn health(&self) -> RedisHealth {
        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    async fn manager(&self) -> Result<ConnectionManager, RedisError> {
        let manager = { self.manager.read().await.clone() };
        manager.ok_or_else(|| RedisError::from((ErrorKind::IoError, "redis is not connected")))
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut manager = self.manager().await?;
        cmd("GET").arg(key).query_async::<_, Option<String>>(&mut manager).await
    }

    /// Writes `key` and registers `member` in `index` in one transaction.
    pub(crate) async fn set_indexed(
        &self,
        key: &str,
        value: &str,
        index: &str,
        member: &str,
    ) -> Result<(), RedisError> {
        let mut manager = self.manager().await?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("SADD")
            .arg(index)
            .arg(member)
            .ignore()
            .query_async::<_, ()>(&mut manager)
            .await
    }

    pub(crate) async fn del_indexed(
        &self,
        key: &str,
        index: &str,
        member: &str,
    ) -> Result<(), RedisError> {
        let mut manager = self.manager().await?;
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(key)
            .ignore()
            .cmd("SREM")
            .arg(index)
            .arg(member)
            .ignore()
            .query_async::<_, ()>(&mut manager)
            .await
    }

    pub(crate) async fn members(&self, index: &str) -> Result<Vec<String>, RedisError> {
        let mut manager = self.manager().await?;
        cmd("SMEMBERS").arg(index).query_async::<_, Vec<String>>(&mut manager).await
    }
}
