//! Shared application state and bootstrap wiring.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::{self, AppConfig};
use crate::error::PluginError;
use crate::lifecycle::PluginManager;
use crate::store::{JsonFileStore, PluginStore};
use crate::supervisor::ProcessSupervisor;

/// Top-level state shared by every command surface of the app.
pub struct AppState {
    pub config: RwLock<AppConfig>,
    pub plugins: PluginManager,
}

impl AppState {
    /// Wire the registry, supervisor, and lifecycle manager from an
    /// `AppConfig`, then reconcile persisted server statuses against the
    /// (empty) live map.
    pub async fn bootstrap(config: AppConfig) -> Result<Arc<Self>, PluginError> {
        let store = Arc::new(JsonFileStore::open(
            config::config_dir().join("registry.json"),
        ));
        Self::bootstrap_with_store(config, store).await
    }

    /// Bootstrap against an explicit store. Tests and embedders point this
    /// at a store outside the platform config dir.
    pub async fn bootstrap_with_store(
        config: AppConfig,
        store: Arc<dyn PluginStore>,
    ) -> Result<Arc<Self>, PluginError> {
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&store),
            Duration::from_millis(config.stop_grace_ms),
        ));
        let plugins = PluginManager::new(store, supervisor, config.plugins_root());

        // A fresh process has no live handles, so every row claiming
        // otherwise is stale.
        plugins.reset_server_statuses().await?;

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            plugins,
        }))
    }

    /// Supervisor metrics snapshot for observability surfaces.
    pub fn server_metrics(&self) -> serde_json::Value {
        self.plugins.supervisor().metrics().snapshot()
    }
}
