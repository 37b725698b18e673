pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod session;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tokio::sync::watch;

use crate::core::config::{CacheBackend, Settings};
use crate::core::{redis::RedisHandle, state::AppState, telemetry};
use crate::repositories::session_cache::{FileStore, RedisStore, SessionCache};
use crate::services::authority_client::HttpAuthority;
use crate::services::channel::WsConnector;
use crate::session::result::ResultMaterializer;
use crate::tasks::driver::EngineContext;
use crate::tasks::registry::SessionRegistry;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let (cache, redis) = open_cache(&settings).await;
    let authority = HttpAuthority::from_settings(settings.authority())?;
    let connector = WsConnector::from_settings(settings.authority())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let context = EngineContext {
        cache,
        authority: Arc::new(authority),
        connector: Arc::new(connector),
        materializer: ResultMaterializer::new(),
        channel: settings.channel().clone(),
        tick_interval: settings.engine().tick_interval,
    };
    let registry = SessionRegistry::new(context, settings.engine().clone(), shutdown_rx.clone());
    let purge = tokio::spawn(tasks::maintenance::purge_loop(
        registry.clone(),
        settings.cache().abandon_grace,
        shutdown_rx,
    ));

    let state = AppState::new(settings, registry.clone());
    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        cache_backend = state.cache().backend(),
        authority = %state.settings().authority().http_url,
        "CBT session engine listening"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(core::shutdown::broadcast_on_signal(shutdown_tx))
        .await;

    registry.join_all().await;
    if let Err(err) = purge.await {
        tracing::error!(error = %err, "Cache maintenance task join failed");
    }

    if let Some(redis) = redis {
        redis.disconnect().await;
        tracing::info!("Redis disconnected");
    }

    result?;

    Ok(())
}

async fn open_cache(settings: &Settings) -> (SessionCache, Option<RedisHandle>) {
    match settings.cache().backend {
        CacheBackend::File => {
            let store = FileStore::new(settings.cache().dir.clone());
            tracing::info!(dir = %settings.cache().dir.display(), "Using file session cache");
            (SessionCache::new(Arc::new(store)), None)
        }
        CacheBackend::Redis => {
            let redis = RedisHandle::new(settings.redis().redis_url());
            if let Err(err) = redis.connect().await {
                tracing::error!(error = %err, "Failed to connect to Redis; continuing without cache");
            } else {
                tracing::info!("Redis connected successfully");
            }
            (SessionCache::new(Arc::new(RedisStore::new(redis.clone()))), Some(redis))
        }
    }
}
