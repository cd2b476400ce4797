//! Application state shared across request handlers.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::persistence::StatePersistence;
use crate::registry::ServiceRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<ServiceRegistry>,
    persistence: Option<StatePersistence>,
    /// Orders snapshot writes so an older config never overwrites a newer one.
    persist_lock: Mutex<()>,
}

impl AppState {
    pub fn new(registry: Arc<ServiceRegistry>, persistence: Option<StatePersistence>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                persistence,
                persist_lock: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    /// Write the current configuration snapshot, if persistence is enabled.
    ///
    /// Failures are logged; the mutation that triggered the write has
    /// already been applied.
    pub async fn persist(&self) {
        let Some(persistence) = &self.inner.persistence else {
            return;
        };

        let _guard = self.inner.persist_lock.lock().await;
        let services = self.inner.registry.config().await;
        if let Err(e) = persistence.save_if_changed(&services) {
            warn!(
                path = %persistence.path().display(),
                error = %e,
                "Failed to save snapshot"
            );
        }
    }
}
