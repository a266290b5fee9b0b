//! Capability-server process supervision.
//!
//! The supervisor owns the only mapping from server id to live OS process.
//! All liveness decisions are made against that map: persisted `status`
//! rows are written as a side effect of transitions and never read back,
//! so a stale `running` row left over from a previous app run cannot block
//! a fresh spawn (the map starts empty on every process).
//!
//! Each spawned process gets an exit-observer task that owns the child
//! handle. Natural exits and explicit stops both funnel their bookkeeping
//! through the same map, where removal is idempotent, so the two paths can
//! race benignly.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::store::{CapabilityServer, PluginStore, ServerStatus};

/// In-memory handle for one live server process.
///
/// The exit-observer task owns the `Child`; this entry holds the pid for
/// display, the channel that tells the observer to terminate, and a
/// generation tag so a stale observer can never remove the entry of a
/// newer process reusing the same server id.
struct LiveServer {
    pid: Option<u32>,
    generation: u64,
    stop_tx: oneshot::Sender<()>,
}

/// Lock-free supervisor counters for observability.
#[derive(Default)]
pub struct SupervisorMetrics {
    total_spawned: AtomicUsize,
    failed_spawns: AtomicUsize,
    live_servers: AtomicUsize,
}

impl SupervisorMetrics {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "total_spawned": self.total_spawned.load(Ordering::Relaxed),
            "failed_spawns": self.failed_spawns.load(Ordering::Relaxed),
            "live_servers": self.live_servers.load(Ordering::Relaxed),
        })
    }
}

/// What happened to one server during a `start` or `stop` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerAction {
    Started,
    AlreadyRunning,
    LaunchFailed,
    Stopped,
    NotRunning,
}

/// Per-server result of a `start`/`stop` call. A launch failure shows up
/// here (and on that server's persisted status) instead of aborting the
/// whole call.
#[derive(Clone, Debug, Serialize)]
pub struct ServerOutcome {
    pub server_id: String,
    pub name: String,
    pub action: ServerAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerOutcome {
    fn new(server: &CapabilityServer, action: ServerAction) -> Self {
        Self {
            server_id: server.id.clone(),
            name: server.name.clone(),
            action,
            error: None,
        }
    }

    fn failed(server: &CapabilityServer, error: String) -> Self {
        Self {
            server_id: server.id.clone(),
            name: server.name.clone(),
            action: ServerAction::LaunchFailed,
            error: Some(error),
        }
    }
}

/// Why an exit observer woke up.
enum ExitCause {
    Exited(std::io::Result<std::process::ExitStatus>),
    StopRequested,
}

pub struct ProcessSupervisor {
    store: Arc<dyn PluginStore>,
    processes: Arc<DashMap<String, LiveServer>>,
    metrics: Arc<SupervisorMetrics>,
    next_generation: AtomicU64,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(store: Arc<dyn PluginStore>, stop_grace: Duration) -> Self {
        Self {
            store,
            processes: Arc::new(DashMap::new()),
            metrics: Arc::new(SupervisorMetrics::default()),
            next_generation: AtomicU64::new(0),
            stop_grace,
        }
    }

    /// Number of live server processes tracked by this instance.
    pub fn live_count(&self) -> usize {
        self.processes.len()
    }

    /// Whether a server id currently has a live process.
    pub fn is_live(&self, server_id: &str) -> bool {
        self.processes.contains_key(server_id)
    }

    pub fn metrics(&self) -> &SupervisorMetrics {
        &self.metrics
    }

    /// Start every capability server of a plugin that is not already live.
    ///
    /// Best-effort across the set: a launch failure is captured in that
    /// server's outcome and persisted as `error`, and the remaining servers
    /// are still attempted. Starting an already-live server is a no-op for
    /// that server, so two starts in quick succession cannot double-spawn.
    pub async fn start(&self, plugin_id: &str) -> Result<Vec<ServerOutcome>, PluginError> {
        let servers = self.store.servers_for_plugin(plugin_id).await?;
        let mut outcomes = Vec::with_capacity(servers.len());

        for server in servers {
            if self.processes.contains_key(&server.id) {
                debug!(server = %server.name, "already running, skipping spawn");
                outcomes.push(ServerOutcome::new(&server, ServerAction::AlreadyRunning));
                continue;
            }

            // Persist the projection before spawning: the exit observer's
            // `stopped` write must never be overtaken by our `running` one
            // when the child exits immediately.
            self.store
                .set_server_status(&server.id, ServerStatus::Running)
                .await?;

            // entry() is the authoritative gate: check-then-insert is
            // atomic per key, so concurrent starts cannot both reach the
            // spawn for the same id.
            let spawned = match self.processes.entry(server.id.clone()) {
                Entry::Occupied(_) => {
                    outcomes.push(ServerOutcome::new(&server, ServerAction::AlreadyRunning));
                    continue;
                }
                Entry::Vacant(slot) => match launch(&server) {
                    Ok(child) => {
                        let (stop_tx, stop_rx) = oneshot::channel();
                        let pid = child.id();
                        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        slot.insert(LiveServer {
                            pid,
                            generation,
                            stop_tx,
                        });
                        self.metrics.total_spawned.fetch_add(1, Ordering::Relaxed);
                        self.metrics.live_servers.fetch_add(1, Ordering::Relaxed);
                        info!(server = %server.name, pid = ?pid, "capability server started");
                        self.spawn_exit_observer(
                            server.id.clone(),
                            server.name.clone(),
                            generation,
                            child,
                            stop_rx,
                        );
                        Ok(())
                    }
                    Err(e) => {
                        self.metrics.failed_spawns.fetch_add(1, Ordering::Relaxed);
                        warn!(server = %server.name, command = %server.command, error = %e,
                            "failed to spawn capability server");
                        Err(e.to_string())
                    }
                },
            };

            // The map guard is gone here; persist failures outside of it.
            match spawned {
                Ok(()) => outcomes.push(ServerOutcome::new(&server, ServerAction::Started)),
                Err(message) => {
                    self.store
                        .set_server_status(&server.id, ServerStatus::Error)
                        .await?;
                    outcomes.push(ServerOutcome::failed(&server, message));
                }
            }
        }

        Ok(outcomes)
    }

    /// Stop every live capability server of a plugin; servers without a
    /// live process are skipped. Termination is signalled, not awaited:
    /// final reaping happens in each exit observer whenever the OS
    /// delivers the exit.
    pub async fn stop(&self, plugin_id: &str) -> Result<Vec<ServerOutcome>, PluginError> {
        let servers = self.store.servers_for_plugin(plugin_id).await?;
        let mut outcomes = Vec::with_capacity(servers.len());

        for server in servers {
            if let Some((_, live)) = self.processes.remove(&server.id) {
                self.metrics.live_servers.fetch_sub(1, Ordering::Relaxed);
                info!(server = %server.name, pid = ?live.pid, "stopping capability server");
                // The observer may already be reaping a natural exit, in
                // which case the send just lands on a closed channel.
                let _ = live.stop_tx.send(());
                self.store
                    .set_server_status(&server.id, ServerStatus::Stopped)
                    .await?;
                outcomes.push(ServerOutcome::new(&server, ServerAction::Stopped));
            } else {
                outcomes.push(ServerOutcome::new(&server, ServerAction::NotRunning));
            }
        }

        Ok(outcomes)
    }

    /// Register the exit observer for a freshly spawned process.
    ///
    /// The task owns the child and waits for whichever comes first: the
    /// process exiting on its own (reap, drop the live entry, persist
    /// `stopped`), or the stop signal (terminate and reap; the stop path
    /// has already removed the map entry and persisted the status).
    ///
    /// The entry is only removed when its generation still matches this
    /// observer, and the status only persisted when that removal actually
    /// happened: a stale observer racing a stop-and-restart must neither
    /// drop the new process's handle nor overwrite its status.
    fn spawn_exit_observer(
        &self,
        server_id: String,
        name: String,
        generation: u64,
        mut child: Child,
        stop_rx: oneshot::Receiver<()>,
    ) {
        let processes = Arc::clone(&self.processes);
        let metrics = Arc::clone(&self.metrics);
        let store = Arc::clone(&self.store);
        let grace = self.stop_grace;

        tokio::spawn(async move {
            // A completed stop_rx also covers the sender being dropped
            // without a signal (supervisor teardown).
            let cause = tokio::select! {
                status = child.wait() => ExitCause::Exited(status),
                _ = stop_rx => ExitCause::StopRequested,
            };

            match cause {
                ExitCause::Exited(status) => {
                    match status {
                        Ok(status) => {
                            info!(server = %name, code = ?status.code(), "capability server exited")
                        }
                        Err(e) => {
                            warn!(server = %name, error = %e, "failed to reap capability server")
                        }
                    }
                    let removed = processes
                        .remove_if(&server_id, |_, live| live.generation == generation)
                        .is_some();
                    if removed {
                        metrics.live_servers.fetch_sub(1, Ordering::Relaxed);
                        if let Err(e) = store
                            .set_server_status(&server_id, ServerStatus::Stopped)
                            .await
                        {
                            warn!(server = %name, error = %e, "failed to persist exit status");
                        }
                    }
                }
                ExitCause::StopRequested => {
                    terminate(&mut child, &name, grace).await;
                }
            }
        });
    }
}

/// Spawn a server process from its launch spec. The env overlay wins over
/// the inherited environment on key collision. Stdin/stdout are detached;
/// stderr stays inherited so server diagnostics land in the host's log.
fn launch(server: &CapabilityServer) -> std::io::Result<Child> {
    let mut cmd = Command::new(&server.command);
    cmd.args(&server.args);
    for (key, value) in &server.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);
    cmd.spawn()
}

/// Terminate a child: polite signal first, hard kill after the grace
/// period. Unix gets SIGTERM so well-behaved servers can flush state.
async fn terminate(child: &mut Child, name: &str, grace: Duration) {
    #[cfg(unix)]
    let signalled = match child.id() {
        // SAFETY: kill(2) with a pid we own via `child`; the call touches
        // no memory and a stale pid only yields ESRCH.
        Some(pid) => unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 },
        None => false,
    };
    #[cfg(not(unix))]
    let signalled = false;

    if signalled {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(server = %name, code = ?status.code(), "capability server terminated");
                return;
            }
            Ok(Err(e)) => {
                warn!(server = %name, error = %e, "failed to reap capability server");
                return;
            }
            Err(_) => debug!(server = %name, "grace period elapsed, killing"),
        }
    }

    if let Err(e) = child.kill().await {
        warn!(server = %name, error = %e, "failed to kill capability server");
    } else {
        info!(server = %name, "capability server killed");
    }
}
