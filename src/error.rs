use thiserror::Error;

/// Errors surfaced by plugin lifecycle operations.
///
/// Per-server launch failures never appear here: they are captured in the
/// per-server outcome collection and recorded on that server's persisted
/// status, so a multi-server start keeps making forward progress.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Unknown plugin id.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// Operation does not apply to this plugin kind.
    #[error("{0}")]
    InvalidState(String),

    /// Manifest validation, path-safety, or filesystem failure during
    /// install/uninstall/import.
    #[error("install failed: {0}")]
    Install(String),

    /// The plugin registry could not complete a record operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the persisted plugin registry.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("failed to persist registry: {0}")]
    Write(String),
}
