//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::Config;
use crate::hub::ConnectionHub;
use crate::registry::FleetRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    hub: Arc<ConnectionHub>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<dyn FleetRegistry>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                hub: Arc::new(ConnectionHub::new(registry)),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The hub other components use to reach nodes.
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.inner.hub
    }

    pub fn registry(&self) -> &Arc<dyn FleetRegistry> {
        self.inner.hub.registry()
    }
}
