//! Plugin manifest parsing, path safety, and file-tree materialization.
//!
//! A plugin ships as a `plugin.json` manifest plus a set of content files.
//! Install recreates that file tree under `{plugins_root}/{name}`; the
//! manifest itself is consumed as metadata and never copied. Every path is
//! validated against traversal out of the plugins root before anything
//! touches the disk; this is a security boundary, not a path computation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path};

use crate::error::PluginError;
use crate::store::PluginKind;

/// File name of the manifest inside a plugin directory or import set.
pub const MANIFEST_FILE: &str = "plugin.json";

/// A capability server declared in a manifest. Becomes one
/// `CapabilityServer` record owned by the installed plugin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Plugin manifest as declared in `plugin.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

/// One content file to be materialized on install.
#[derive(Clone, Debug)]
pub struct PluginFile {
    /// Path relative to the plugin directory.
    pub path: String,
    pub contents: Vec<u8>,
}

impl PluginFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// Returns true if a relative path attempts to escape its root via `..`,
/// absolute components, or other shenanigans.
fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);

    if path.is_absolute() {
        return true;
    }

    for component in path.components() {
        match component {
            Component::ParentDir => return true,
            Component::RootDir | Component::Prefix(_) => return true,
            _ => {}
        }
    }

    false
}

/// Validate a plugin name as a single safe path segment: it becomes the
/// directory name under the plugins root.
fn validate_name(name: &str) -> Result<(), PluginError> {
    if name.trim().is_empty() {
        return Err(PluginError::Install("plugin name is empty".into()));
    }
    if name.starts_with('.') {
        return Err(PluginError::Install(format!(
            "plugin name \"{name}\" must not start with a dot"
        )));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(PluginError::Install(format!(
            "plugin name \"{name}\" is not a safe directory name"
        ))),
    }
}

/// Validate a parsed manifest for required fields and sanity.
pub(crate) fn validate_manifest(manifest: &PluginManifest) -> Result<(), PluginError> {
    validate_name(&manifest.name)?;

    match manifest.kind {
        PluginKind::Html => {
            let entry = manifest.entry_point.as_deref().unwrap_or("");
            if entry.is_empty() {
                return Err(PluginError::Install(
                    "html plugin requires an entry_point".into(),
                ));
            }
            if is_path_escape(entry) {
                return Err(PluginError::Install(format!(
                    "entry_point \"{entry}\" attempts path traversal"
                )));
            }
            if !manifest.servers.is_empty() {
                return Err(PluginError::Install(
                    "html plugin cannot declare capability servers".into(),
                ));
            }
        }
        PluginKind::CapabilityServer => {
            for server in &manifest.servers {
                if server.name.trim().is_empty() {
                    return Err(PluginError::Install("server name is empty".into()));
                }
                if server.command.trim().is_empty() {
                    return Err(PluginError::Install(format!(
                        "server \"{}\" has an empty command",
                        server.name
                    )));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// File-tree materialization
// ---------------------------------------------------------------------------

/// Recreate the plugin's file tree under `dir`, creating directories as
/// needed. The whole set is traversal-checked before the first write, so a
/// malicious path means nothing lands on disk. Files named `plugin.json`
/// are skipped at any depth; the manifest is metadata, not content.
pub(crate) fn materialize_files(dir: &Path, files: &[PluginFile]) -> Result<(), PluginError> {
    for file in files {
        if file.path.is_empty() || is_path_escape(&file.path) {
            return Err(PluginError::Install(format!(
                "file path \"{}\" attempts path traversal",
                file.path
            )));
        }
    }

    std::fs::create_dir_all(dir)
        .map_err(|e| PluginError::Install(format!("failed to create {}: {e}", dir.display())))?;

    for file in files {
        let relative = Path::new(&file.path);
        if relative.file_name().and_then(|n| n.to_str()) == Some(MANIFEST_FILE) {
            continue;
        }
        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PluginError::Install(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(&target, &file.contents).map_err(|e| {
            PluginError::Install(format!("failed to write {}: {e}", target.display()))
        })?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Directory import
// ---------------------------------------------------------------------------

/// Read and parse `{dir}/plugin.json`.
pub(crate) fn read_manifest(dir: &Path) -> Result<PluginManifest, PluginError> {
    let path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| PluginError::Install(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| PluginError::Install(format!("invalid {MANIFEST_FILE}: {e}")))
}

/// Recursively collect every file under `dir` (except the manifest) as
/// relative-path/bytes pairs for install.
pub(crate) fn collect_plugin_files(dir: &Path) -> Result<Vec<PluginFile>, PluginError> {
    fn walk(dir: &Path, base: &Path, out: &mut Vec<PluginFile>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                walk(&path, base, out)?;
            } else if path.file_name().and_then(|n| n.to_str()) != Some(MANIFEST_FILE)
                && let Ok(relative) = path.strip_prefix(base)
            {
                out.push(PluginFile {
                    path: relative.to_string_lossy().replace('\\', "/"),
                    contents: std::fs::read(&path)?,
                });
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files)
        .map_err(|e| PluginError::Install(format!("failed to read plugin directory: {e}")))?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
