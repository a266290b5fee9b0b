//! Plugin lifecycle orchestration: install, uninstall, enable/disable.
//!
//! The manager coordinates the registry and the process supervisor but
//! owns neither: records live in the store, live process handles live in
//! the supervisor. Ordering between the two is chosen so that every crash
//! window leaves detectable, restartable state rather than an orphaned
//! process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PluginError;
use crate::install::{self, PluginFile, PluginManifest};
use crate::store::{
    CapabilityServer, Plugin, PluginKind, PluginPatch, PluginStore, ServerStatus,
};
use crate::supervisor::{ProcessSupervisor, ServerOutcome};

#[derive(Clone)]
pub struct PluginManager {
    store: Arc<dyn PluginStore>,
    supervisor: Arc<ProcessSupervisor>,
    plugins_root: PathBuf,
}

impl PluginManager {
    pub fn new(
        store: Arc<dyn PluginStore>,
        supervisor: Arc<ProcessSupervisor>,
        plugins_root: PathBuf,
    ) -> Self {
        Self {
            store,
            supervisor,
            plugins_root,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Directory a plugin's files live in.
    pub fn plugin_dir(&self, plugin: &Plugin) -> PathBuf {
        self.plugins_root.join(&plugin.name)
    }

    /// Install a plugin from a manifest plus its content files.
    /// The new plugin starts disabled; nothing is spawned here.
    pub async fn install_plugin(
        &self,
        manifest: PluginManifest,
        files: &[PluginFile],
    ) -> Result<Plugin, PluginError> {
        install::validate_manifest(&manifest)?;

        let dir = self.plugins_root.join(&manifest.name);
        if dir.exists() {
            return Err(PluginError::Install(format!(
                "plugin \"{}\" is already installed",
                manifest.name
            )));
        }
        install::materialize_files(&dir, files)?;

        let PluginManifest {
            name,
            kind,
            version,
            description,
            author,
            entry_point,
            servers,
        } = manifest;

        let now = Utc::now();
        let plugin = self
            .store
            .insert_plugin(Plugin {
                id: Uuid::new_v4().to_string(),
                name,
                kind,
                enabled: false,
                entry_point,
                version,
                description,
                author,
                installed_at: now,
                updated_at: now,
            })
            .await?;

        for spec in servers {
            self.store
                .insert_server(CapabilityServer {
                    id: Uuid::new_v4().to_string(),
                    plugin_id: plugin.id.clone(),
                    name: spec.name,
                    command: spec.command,
                    args: spec.args,
                    env: spec.env,
                    status: ServerStatus::Stopped,
                })
                .await?;
        }

        info!(plugin = %plugin.name, kind = ?plugin.kind, "plugin installed");
        Ok(plugin)
    }

    /// Install a plugin from a directory on disk containing a `plugin.json`
    /// manifest next to its content files.
    pub async fn import_plugin_dir(&self, dir: &Path) -> Result<Plugin, PluginError> {
        let manifest = install::read_manifest(dir)?;
        let files = install::collect_plugin_files(dir)?;
        self.install_plugin(manifest, &files).await
    }

    /// Uninstall a plugin: stop any live servers, remove the on-disk tree,
    /// then delete the records. With this ordering a crash mid-way can
    /// leave an orphaned directory, but never a live process whose record
    /// is already gone.
    pub async fn uninstall_plugin(&self, id: &str) -> Result<(), PluginError> {
        let plugin = self.require_plugin(id).await?;

        if plugin.kind == PluginKind::CapabilityServer {
            self.supervisor.stop(id).await?;
        }

        let dir = self.plugin_dir(&plugin);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| {
                PluginError::Install(format!("failed to remove {}: {e}", dir.display()))
            })?;
        }

        self.store.delete_servers_for_plugin(id).await?;
        self.store.delete_plugin(id).await?;

        info!(plugin = %plugin.name, "plugin uninstalled");
        Ok(())
    }

    /// Enable or disable a plugin.
    ///
    /// Disabling stops capability servers before the flag is persisted, so
    /// a crash in between leaves an enabled plugin with no live process
    /// rather than a disabled one with an orphaned process. Enabling
    /// persists the flag first for the mirror-image reason. Html plugins
    /// are a pure metadata flip; opening a window is a separate explicit
    /// user action.
    pub async fn toggle_plugin(&self, id: &str, enabled: bool) -> Result<Plugin, PluginError> {
        let plugin = self.require_plugin(id).await?;

        if enabled {
            let updated = self
                .store
                .update_plugin(
                    id,
                    PluginPatch {
                        enabled: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            if plugin.kind == PluginKind::CapabilityServer {
                self.supervisor.start(id).await?;
            }
            Ok(updated)
        } else {
            if plugin.kind == PluginKind::CapabilityServer {
                self.supervisor.stop(id).await?;
            }
            let updated = self
                .store
                .update_plugin(
                    id,
                    PluginPatch {
                        enabled: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(updated)
        }
    }

    /// Start every capability server owned by a plugin. Best-effort:
    /// inspect the returned outcomes for per-server failures.
    pub async fn start_capability_servers(
        &self,
        id: &str,
    ) -> Result<Vec<ServerOutcome>, PluginError> {
        self.require_server_plugin(id).await?;
        self.supervisor.start(id).await
    }

    /// Stop every live capability server owned by a plugin.
    pub async fn stop_capability_servers(
        &self,
        id: &str,
    ) -> Result<Vec<ServerOutcome>, PluginError> {
        self.require_server_plugin(id).await?;
        self.supervisor.stop(id).await
    }

    /// All installed plugins, newest install first.
    pub async fn plugins(&self) -> Result<Vec<Plugin>, PluginError> {
        Ok(self.store.plugins().await?)
    }

    pub async fn plugin(&self, id: &str) -> Result<Option<Plugin>, PluginError> {
        Ok(self.store.plugin(id).await?)
    }

    /// Server records owned by a plugin, with their persisted status.
    pub async fn capability_servers(
        &self,
        id: &str,
    ) -> Result<Vec<CapabilityServer>, PluginError> {
        Ok(self.store.servers_for_plugin(id).await?)
    }

    /// Reset every persisted server status to `stopped`. Runs at startup:
    /// the live map starts empty on a fresh process, so any `running` or
    /// `error` row left behind by a previous run is stale.
    pub async fn reset_server_statuses(&self) -> Result<(), PluginError> {
        for server in self.store.servers().await? {
            if server.status != ServerStatus::Stopped {
                debug!(server = %server.name, status = ?server.status,
                    "resetting stale server status");
                self.store
                    .set_server_status(&server.id, ServerStatus::Stopped)
                    .await?;
            }
        }
        Ok(())
    }

    async fn require_plugin(&self, id: &str) -> Result<Plugin, PluginError> {
        self.store
            .plugin(id)
            .await?
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    async fn require_server_plugin(&self, id: &str) -> Result<Plugin, PluginError> {
        let plugin = self.require_plugin(id).await?;
        if plugin.kind != PluginKind::CapabilityServer {
            return Err(PluginError::InvalidState(format!(
                "plugin \"{}\" has no capability servers",
                plugin.name
            )));
        }
        Ok(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::ServerSpec;
    use crate::store::JsonFileStore;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        plugins_root: PathBuf,
        store: Arc<JsonFileStore>,
        manager: PluginManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let plugins_root = dir.path().join("plugins");
        let store = Arc::new(JsonFileStore::open(dir.path().join("registry.json")));
        let supervisor = Arc::new(ProcessSupervisor::new(
            store.clone(),
            Duration::from_millis(200),
        ));
        let manager = PluginManager::new(store.clone(), supervisor, plugins_root.clone());
        Fixture {
            _dir: dir,
            plugins_root,
            store,
            manager,
        }
    }

    fn html_manifest(name: &str) -> PluginManifest {
        PluginManifest {
            name: name.to_string(),
            kind: PluginKind::Html,
            version: "1.0.0".to_string(),
            description: Some("widget".to_string()),
            author: None,
            entry_point: Some("index.html".to_string()),
            servers: vec![],
        }
    }

    fn server_manifest(name: &str, command: &str, args: &[&str]) -> PluginManifest {
        PluginManifest {
            name: name.to_string(),
            kind: PluginKind::CapabilityServer,
            version: "1.0.0".to_string(),
            description: None,
            author: None,
            entry_point: None,
            servers: vec![ServerSpec {
                name: name.to_string(),
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: HashMap::new(),
            }],
        }
    }

    async fn wait_for_no_live(manager: &PluginManager) {
        for _ in 0..200 {
            if manager.supervisor().live_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("live handles not cleared");
    }

    #[tokio::test]
    async fn install_materializes_files_and_records() {
        let fx = fixture();
        let files = vec![
            PluginFile::new("index.html", b"<html>".to_vec()),
            PluginFile::new("plugin.json", b"{}".to_vec()),
        ];

        let plugin = fx
            .manager
            .install_plugin(html_manifest("widget"), &files)
            .await
            .unwrap();

        assert!(!plugin.enabled);
        assert_eq!(plugin.kind, PluginKind::Html);
        assert!(fx.plugins_root.join("widget/index.html").exists());
        assert!(!fx.plugins_root.join("widget/plugin.json").exists());
        assert!(fx.manager.plugin(&plugin.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn install_creates_server_records_stopped() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(server_manifest("echo", "echo", &["hi"]), &[])
            .await
            .unwrap();

        let servers = fx.manager.capability_servers(&plugin.id).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].command, "echo");
        assert_eq!(servers[0].status, ServerStatus::Stopped);
        assert_eq!(servers[0].plugin_id, plugin.id);
    }

    #[tokio::test]
    async fn install_rejects_existing_directory() {
        let fx = fixture();
        fx.manager
            .install_plugin(html_manifest("widget"), &[])
            .await
            .unwrap();

        let err = fx
            .manager
            .install_plugin(html_manifest("widget"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Install(_)));
    }

    #[tokio::test]
    async fn install_rejects_traversal_name_without_writing() {
        let fx = fixture();
        let mut manifest = html_manifest("widget");
        manifest.name = "../escape".to_string();

        let err = fx
            .manager
            .install_plugin(manifest, &[PluginFile::new("index.html", b"x".to_vec())])
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Install(_)));
        assert!(!fx.plugins_root.exists());
        assert!(fx.manager.plugins().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn toggle_unknown_plugin_is_not_found() {
        let fx = fixture();
        let err = fx.manager.toggle_plugin("ghost", true).await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn toggle_html_plugin_is_metadata_only() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(html_manifest("widget"), &[])
            .await
            .unwrap();

        let updated = fx.manager.toggle_plugin(&plugin.id, true).await.unwrap();
        assert!(updated.enabled);
        assert_eq!(fx.manager.supervisor().live_count(), 0);

        let updated = fx.manager.toggle_plugin(&plugin.id, false).await.unwrap();
        assert!(!updated.enabled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn toggle_starts_and_stops_capability_servers() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(server_manifest("sleeper", "sleep", &["30"]), &[])
            .await
            .unwrap();

        let updated = fx.manager.toggle_plugin(&plugin.id, true).await.unwrap();
        assert!(updated.enabled);
        assert_eq!(fx.manager.supervisor().live_count(), 1);

        let servers = fx.manager.capability_servers(&plugin.id).await.unwrap();
        assert_eq!(servers[0].status, ServerStatus::Running);

        let updated = fx.manager.toggle_plugin(&plugin.id, false).await.unwrap();
        assert!(!updated.enabled);
        // Map entries are gone as soon as toggle returns
        assert_eq!(fx.manager.supervisor().live_count(), 0);
        let servers = fx.manager.capability_servers(&plugin.id).await.unwrap();
        assert_eq!(servers[0].status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn start_on_zero_server_plugin_is_empty_success() {
        let fx = fixture();
        let mut manifest = server_manifest("empty", "unused", &[]);
        manifest.servers.clear();
        let plugin = fx.manager.install_plugin(manifest, &[]).await.unwrap();

        let outcomes = fx
            .manager
            .start_capability_servers(&plugin.id)
            .await
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(fx.manager.supervisor().live_count(), 0);
    }

    #[tokio::test]
    async fn start_on_html_plugin_is_invalid_state() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(html_manifest("widget"), &[])
            .await
            .unwrap();

        let err = fx
            .manager
            .start_capability_servers(&plugin.id)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidState(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uninstall_enabled_plugin_stops_servers_before_removing_files() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(
                server_manifest("sleeper", "sleep", &["30"]),
                &[PluginFile::new("README.md", b"docs".to_vec())],
            )
            .await
            .unwrap();

        fx.manager.toggle_plugin(&plugin.id, true).await.unwrap();
        assert_eq!(fx.manager.supervisor().live_count(), 1);
        let dir = fx.plugins_root.join("sleeper");
        assert!(dir.exists());

        fx.manager.uninstall_plugin(&plugin.id).await.unwrap();

        assert_eq!(fx.manager.supervisor().live_count(), 0);
        assert!(!dir.exists());
        assert!(fx.manager.plugin(&plugin.id).await.unwrap().is_none());
        assert!(fx.store.servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uninstall_unknown_plugin_is_not_found() {
        let fx = fixture();
        let err = fx.manager.uninstall_plugin("ghost").await.unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn uninstall_survives_missing_directory() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(html_manifest("widget"), &[])
            .await
            .unwrap();
        std::fs::remove_dir_all(fx.plugins_root.join("widget")).unwrap();

        fx.manager.uninstall_plugin(&plugin.id).await.unwrap();
        assert!(fx.manager.plugin(&plugin.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn import_plugin_dir_round_trips_the_tree() {
        let fx = fixture();
        let source = TempDir::new().unwrap();
        std::fs::write(
            source.path().join("plugin.json"),
            r#"{ "name": "widget", "type": "html", "entry_point": "index.html" }"#,
        )
        .unwrap();
        std::fs::write(source.path().join("index.html"), "<html>").unwrap();
        std::fs::create_dir_all(source.path().join("assets")).unwrap();
        std::fs::write(source.path().join("assets/app.css"), "body{}").unwrap();

        let plugin = fx.manager.import_plugin_dir(source.path()).await.unwrap();

        assert_eq!(plugin.name, "widget");
        assert_eq!(plugin.entry_point.as_deref(), Some("index.html"));
        let dir = fx.plugins_root.join("widget");
        assert!(dir.join("index.html").exists());
        assert!(dir.join("assets/app.css").exists());
        assert!(!dir.join("plugin.json").exists());
    }

    #[tokio::test]
    async fn reset_server_statuses_clears_stale_rows() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(server_manifest("echo", "echo", &["hi"]), &[])
            .await
            .unwrap();
        let servers = fx.manager.capability_servers(&plugin.id).await.unwrap();
        fx.store
            .set_server_status(&servers[0].id, ServerStatus::Running)
            .await
            .unwrap();

        fx.manager.reset_server_statuses().await.unwrap();

        let servers = fx.manager.capability_servers(&plugin.id).await.unwrap();
        assert_eq!(servers[0].status, ServerStatus::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fast_exit_is_observed_without_explicit_stop() {
        let fx = fixture();
        let plugin = fx
            .manager
            .install_plugin(server_manifest("echo", "echo", &["hi"]), &[])
            .await
            .unwrap();

        fx.manager.toggle_plugin(&plugin.id, true).await.unwrap();
        wait_for_no_live(&fx.manager).await;

        for _ in 0..200 {
            let servers = fx.manager.capability_servers(&plugin.id).await.unwrap();
            if servers[0].status == ServerStatus::Stopped {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("fast exit not reflected in persisted status");
    }
}
