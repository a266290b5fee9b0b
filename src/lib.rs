//! ChatDeck backend core.
//!
//! ChatDeck is a desktop app for chatting with a configurable AI backend,
//! extensible with two plugin kinds: sandboxed HTML micro-apps and locally
//! spawned capability servers (helper processes speaking an opaque
//! request/response protocol). This crate is the backend the UI shell's
//! command layer calls into:
//!
//! - `store`: persisted `Plugin` / `CapabilityServer` records behind the
//!   [`PluginStore`] trait (JSON-file-backed by default)
//! - `supervisor`: live process table plus exit observation for
//!   capability servers
//! - `lifecycle`: install / uninstall / enable / disable orchestration
//! - `install`: manifest parsing, path safety, file-tree materialization
//! - `config`: platform config dir and `AppConfig`
//! - `state`: [`AppState`] bootstrap wiring it all together

pub mod config;
pub mod error;
pub mod install;
pub mod lifecycle;
pub mod state;
pub mod store;
pub mod supervisor;

pub use config::AppConfig;
pub use error::{PluginError, StoreError};
pub use install::{MANIFEST_FILE, PluginFile, PluginManifest, ServerSpec};
pub use lifecycle::PluginManager;
pub use state::AppState;
pub use store::{CapabilityServer, JsonFileStore, Plugin, PluginKind, PluginStore, ServerStatus};
pub use supervisor::{ProcessSupervisor, ServerAction, ServerOutcome};

/// Install an env-filtered tracing subscriber (`RUST_LOG` controls levels,
/// default `info`). Intended for the app shell and examples; calling it
/// more than once is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
