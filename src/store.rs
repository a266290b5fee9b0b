//! Persisted plugin registry.
//!
//! `Plugin` and `CapabilityServer` records live behind the [`PluginStore`]
//! trait; the production implementation keeps them in a single JSON file
//! under the config directory, rewritten atomically on every mutation.
//!
//! The `status` column on a server record is a display projection written by
//! the process supervisor as a side effect of its transitions. It is never
//! read back to decide whether a process may be started; the supervisor's
//! in-memory map is the only authority for liveness.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::StoreError;

/// Plugin kind: sandboxed HTML micro-app, or a bundle of capability servers.
/// Immutable after creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    Html,
    CapabilityServer,
}

/// Persisted liveness projection for a capability server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

/// An installed plugin. `name` doubles as the on-disk directory name and is
/// validated as a safe path segment before a record is ever created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plugin {
    pub id: String,
    pub name: String,
    pub kind: PluginKind,
    pub enabled: bool,
    /// Relative path to the HTML entry file; only meaningful for kind=html.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A helper server process owned by one plugin: the launch spec the
/// supervisor feeds to the OS, plus the persisted status projection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityServer {
    pub id: String,
    pub plugin_id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overlay merged over the host environment; overlay wins
    /// on key collision.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub status: ServerStatus,
}

/// Fields of a plugin record that callers may update in place.
/// `Some` sets the field; `None` leaves it untouched.
#[derive(Clone, Debug, Default)]
pub struct PluginPatch {
    pub enabled: Option<bool>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
}

/// CRUD surface of the plugin registry. Every call is an atomic
/// single-record operation; server listings are scoped by owning plugin.
#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn insert_plugin(&self, plugin: Plugin) -> Result<Plugin, StoreError>;
    async fn plugin(&self, id: &str) -> Result<Option<Plugin>, StoreError>;
    /// All plugins, newest install first.
    async fn plugins(&self) -> Result<Vec<Plugin>, StoreError>;
    /// Apply a patch and touch `updated_at`. Unknown ids error.
    async fn update_plugin(&self, id: &str, patch: PluginPatch) -> Result<Plugin, StoreError>;
    /// Delete a plugin record; deleting a missing record is a no-op.
    async fn delete_plugin(&self, id: &str) -> Result<(), StoreError>;

    async fn insert_server(&self, server: CapabilityServer)
    -> Result<CapabilityServer, StoreError>;
    /// Servers owned by one plugin.
    async fn servers_for_plugin(&self, plugin_id: &str)
    -> Result<Vec<CapabilityServer>, StoreError>;
    /// Every server record regardless of owner.
    async fn servers(&self) -> Result<Vec<CapabilityServer>, StoreError>;
    /// Persist the liveness projection. Unknown ids are a no-op: an exit
    /// observer may fire after its plugin was already uninstalled.
    async fn set_server_status(&self, id: &str, status: ServerStatus) -> Result<(), StoreError>;
    async fn delete_servers_for_plugin(&self, plugin_id: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// JSON-file-backed store
// ---------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
struct RegistryData {
    #[serde(default)]
    plugins: Vec<Plugin>,
    #[serde(default)]
    servers: Vec<CapabilityServer>,
}

/// Registry persisted as `registry.json`: records held in memory behind an
/// RwLock, flushed atomically (temp + rename) on every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    data: RwLock<RegistryData>,
}

impl JsonFileStore {
    /// Open (or create) the registry at the default location
    /// `{config_dir}/registry.json`.
    pub fn open_default() -> Self {
        Self::open(config::config_dir().join("registry.json"))
    }

    /// Open (or create) the registry at an explicit path.
    pub fn open(path: PathBuf) -> Self {
        let data = config::load_json_file(&path);
        Self {
            path,
            data: RwLock::new(data),
        }
    }

    fn flush(&self, data: &RegistryData) -> Result<(), StoreError> {
        config::save_json_file(&self.path, data).map_err(StoreError::Write)
    }
}

#[async_trait]
impl PluginStore for JsonFileStore {
    async fn insert_plugin(&self, plugin: Plugin) -> Result<Plugin, StoreError> {
        let mut data = self.data.write();
        data.plugins.push(plugin.clone());
        self.flush(&data)?;
        Ok(plugin)
    }

    async fn plugin(&self, id: &str) -> Result<Option<Plugin>, StoreError> {
        Ok(self.data.read().plugins.iter().find(|p| p.id == id).cloned())
    }

    async fn plugins(&self) -> Result<Vec<Plugin>, StoreError> {
        let mut plugins = self.data.read().plugins.clone();
        plugins.sort_by(|a, b| b.installed_at.cmp(&a.installed_at));
        Ok(plugins)
    }

    async fn update_plugin(&self, id: &str, patch: PluginPatch) -> Result<Plugin, StoreError> {
        let mut data = self.data.write();
        let plugin = data
            .plugins
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(enabled) = patch.enabled {
            plugin.enabled = enabled;
        }
        if let Some(version) = patch.version {
            plugin.version = version;
        }
        if let Some(description) = patch.description {
            plugin.description = Some(description);
        }
        if let Some(author) = patch.author {
            plugin.author = Some(author);
        }
        plugin.updated_at = Utc::now();

        let updated = plugin.clone();
        self.flush(&data)?;
        Ok(updated)
    }

    async fn delete_plugin(&self, id: &str) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let before = data.plugins.len();
        data.plugins.retain(|p| p.id != id);
        if data.plugins.len() != before {
            self.flush(&data)?;
        }
        Ok(())
    }

    async fn insert_server(
        &self,
        server: CapabilityServer,
    ) -> Result<CapabilityServer, StoreError> {
        let mut data = self.data.write();
        data.servers.push(server.clone());
        self.flush(&data)?;
        Ok(server)
    }

    async fn servers_for_plugin(
        &self,
        plugin_id: &str,
    ) -> Result<Vec<CapabilityServer>, StoreError> {
        Ok(self
            .data
            .read()
            .servers
            .iter()
            .filter(|s| s.plugin_id == plugin_id)
            .cloned()
            .collect())
    }

    async fn servers(&self) -> Result<Vec<CapabilityServer>, StoreError> {
        Ok(self.data.read().servers.clone())
    }

    async fn set_server_status(&self, id: &str, status: ServerStatus) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let Some(server) = data.servers.iter_mut().find(|s| s.id == id) else {
            return Ok(());
        };
        if server.status == status {
            return Ok(());
        }
        server.status = status;
        self.flush(&data)
    }

    async fn delete_servers_for_plugin(&self, plugin_id: &str) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let before = data.servers.len();
        data.servers.retain(|s| s.plugin_id != plugin_id);
        if data.servers.len() != before {
            self.flush(&data)?;
        }
        Ok(())
    }
}
