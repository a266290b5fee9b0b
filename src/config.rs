use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Get the config directory using platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/chatdeck/`
/// - Linux: `~/.config/chatdeck/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/chatdeck/`
///
/// Falls back to `~/.chatdeck/` if the platform dir is unavailable.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("chatdeck"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".chatdeck")
        })
}

/// Default root directory for installed plugins: `{config_dir}/plugins/`
pub fn plugins_dir() -> PathBuf {
    config_dir().join("plugins")
}

/// Load a JSON file, returning Default if missing or corrupt.
/// Logs warnings/errors when the file exists but cannot be read or parsed,
/// so corrupt files are visible in logs instead of silently resetting state.
pub(crate) fn load_json_file<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("could not read {}: {e}", path.display());
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("corrupt file {}: {e}. Using defaults.", path.display());
            T::default()
        }
    }
}

/// Save a JSON file atomically (temp file + rename).
/// Sets 0600 permissions on Unix since server env overlays can carry secrets.
pub(crate) fn save_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let dir = path
        .parent()
        .ok_or_else(|| format!("no parent directory for {}", path.display()))?;
    std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create directory: {e}"))?;

    let json =
        serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize: {e}"))?;

    let temp = path.with_extension(format!("tmp.{}", std::process::id()));

    std::fs::write(&temp, &json).map_err(|e| format!("Failed to write temp file: {e}"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&temp, perms)
            .map_err(|e| format!("Failed to set permissions: {e}"))?;
    }

    // Atomic rename: either the old file or new file exists, never partial
    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        format!("Failed to commit file: {e}")
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

fn default_stop_grace_ms() -> u64 {
    2000
}

/// Application-level settings persisted as `config.json` in the config dir.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Override for the plugins root directory (default: `{config_dir}/plugins`)
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,
    /// Grace period in milliseconds between the termination signal and a
    /// hard kill when stopping a capability server
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plugins_dir: None,
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl AppConfig {
    /// Effective plugins root: explicit override > platform default.
    pub fn plugins_root(&self) -> PathBuf {
        self.plugins_dir.clone().unwrap_or_else(plugins_dir)
    }
}

/// Load `config.json` from the config dir (defaults if missing or corrupt).
pub fn load_app_config() -> AppConfig {
    load_json_file(&config_dir().join("config.json"))
}

/// Save `config.json` to the config dir.
pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    save_json_file(&config_dir().join("config.json"), config)
}
