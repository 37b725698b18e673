use std::sync::Arc;

use crate::core::config::Settings;
use crate::repositories::session_cache::SessionCache;
use crate::session::result::ResultMaterializer;
use crate::tasks::registry::SessionRegistry;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    registry: SessionRegistry,
}

impl AppState {
    pub(crate) fn new(settings: Settings, registry: SessionRegistry) -> Self {
        Self { inner: Arc::new(InnerState { settings, registry }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub(crate) fn cache(&self) -> &SessionCache {
        &self.inner.registry.context().cache
    }

    pub(crate) fn materializer(&self) -> &ResultMaterializer {
        &self.inner.registry.context().materializer
    }
}
