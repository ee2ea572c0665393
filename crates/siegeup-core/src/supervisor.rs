//! The reconciliation engine.
//!
//! A single owning task holds the desired-server set, the live-children map
//! and the per-port last-error map. Facade handlers talk to it over a
//! command channel and await replies; per-child monitor tasks report exits
//! on a second channel; a fixed-cadence interval drives reconcile ticks.
//! Because every mutation happens on this one task, per-port lifecycle
//! transitions are serialized and ticks can never overlap.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::builds::BuildStore;
use crate::logs;
use crate::port;
use crate::process::{self, ChildExit, ChildInstance, GRACEFUL_WAIT, KILL_WAIT};
use crate::settings::{self, DesiredServer, Settings, SettingsError};

/// Cadence of the reconcile loop.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(2000);

/// Errors surfaced to facade callers.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The supervisor task is no longer running.
    #[error("supervisor task is gone")]
    Closed,

    /// The port is not part of the desired set.
    #[error("no server configured on port {0}")]
    UnknownPort(u16),

    /// The desired set could not be persisted.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The build store could not be swept.
    #[error("purge failed: {0}")]
    Purge(#[from] std::io::Error),
}

/// Status of one desired server, as observed by the supervisor.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    /// The persisted entry.
    pub server: DesiredServer,
    /// Pid of the live child, if any.
    pub pid: Option<u32>,
    /// Whether a child currently exists for the port.
    pub running: bool,
    /// Most recent per-port failure, if any.
    pub launch_error: Option<String>,
}

enum Command {
    ApplyServers {
        servers: Vec<DesiredServer>,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Restart {
        port: u16,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Purge {
        reply: oneshot::Sender<Result<Vec<String>, SupervisorError>>,
    },
    Status {
        reply: oneshot::Sender<Vec<ServerStatus>>,
    },
    StopAll {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle for sending commands to the supervisor task.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    /// Replaces the desired-server set and persists it. Children whose port
    /// left the set, whose spawn parameters changed, or whose entry turned
    /// `run=false` are stopped before the new set is written.
    ///
    /// # Errors
    ///
    /// Returns an error when the supervisor is gone or persistence fails.
    /// Port uniqueness is the caller's contract (validated at the facade).
    pub async fn apply_servers(&self, servers: Vec<DesiredServer>) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::ApplyServers { servers, reply: tx })
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)?
    }

    /// Stops the child on `port` if one is running; the next reconcile tick
    /// respawns it.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownPort`] when the port is not in the
    /// desired set.
    pub async fn restart(&self, port: u16) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Restart { port, reply: tx })
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)?
    }

    /// Removes build versions not referenced by any live child and returns
    /// the removed names.
    ///
    /// # Errors
    ///
    /// Returns an error when the supervisor is gone or the sweep fails.
    pub async fn purge(&self) -> Result<Vec<String>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Purge { reply: tx })
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)?
    }

    /// Snapshot of every desired server with its observed state.
    ///
    /// # Errors
    ///
    /// Returns an error when the supervisor is gone.
    pub async fn status(&self) -> Result<Vec<ServerStatus>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply: tx })
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Gracefully stops every live child. Used on agent shutdown and
    /// self-update.
    ///
    /// # Errors
    ///
    /// Returns an error when the supervisor is gone.
    pub async fn stop_all(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::StopAll { reply: tx })
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }
}

/// Starts the supervisor task for `base`, loading the persisted desired set,
/// and returns the command handle.
#[must_use]
pub fn spawn(base: PathBuf, builds: BuildStore) -> SupervisorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (exit_tx, exit_rx) = mpsc::channel(32);
    let supervisor = Supervisor {
        logs_root: base.join("logs"),
        settings: settings::load(&base),
        base,
        builds,
        children: HashMap::new(),
        errors: HashMap::new(),
        cmd_rx,
        exit_tx,
        exit_rx,
    };
    tokio::spawn(supervisor.run());
    SupervisorHandle { tx: cmd_tx }
}

struct Supervisor {
    base: PathBuf,
    builds: BuildStore,
    logs_root: PathBuf,
    settings: Settings,
    children: HashMap<u16, ChildInstance>,
    errors: HashMap<u16, String>,
    cmd_rx: mpsc::Receiver<Command>,
    exit_tx: mpsc::Sender<ChildExit>,
    exit_rx: mpsc::Receiver<ChildExit>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut tick = interval(WATCH_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(servers = self.settings.servers.len(), "supervisor started");

        loop {
            tokio::select! {
                _ = tick.tick() => self.reconcile().await,
                Some(exit) = self.exit_rx.recv() => self.observe_exit(exit).await,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
        }
        debug!("supervisor task ending");
    }

    /// One reconcile pass: start whatever is desired, runnable and not
    /// already live. Failures are per-port and never abort the pass.
    async fn reconcile(&mut self) {
        for desired in self.settings.servers.clone() {
            if self.children.contains_key(&desired.port) || !desired.run {
                continue;
            }
            self.start_server(&desired).await;
        }
    }

    async fn start_server(&mut self, desired: &DesiredServer) {
        let port = desired.port;
        let Some(executable) = self.builds.find_executable(&desired.version) else {
            self.errors.insert(
                port,
                format!("Executable not found for version '{}'", desired.version),
            );
            return;
        };

        let (log_file, log_path) = match logs::open_for_launch(&self.logs_root, port).await {
            Ok(opened) => opened,
            Err(e) => {
                self.errors
                    .insert(port, format!("Failed to open log file: {e}"));
                return;
            },
        };

        match process::spawn(desired, &executable, log_file, self.exit_tx.clone()) {
            Ok(child) => {
                info!(
                    port,
                    pid = child.pid,
                    version = %desired.version,
                    log = %log_path.display(),
                    "server started"
                );
                self.errors.remove(&port);
                self.children.insert(port, child);
            },
            Err(e) => {
                warn!(port, "spawn failed: {e}");
                self.errors.insert(port, format!("Failed to spawn server: {e}"));
            },
        }
    }

    /// Handles an exit reported by a monitor task. The port wait prevents an
    /// immediate respawn from racing the released socket.
    async fn observe_exit(&mut self, exit: ChildExit) {
        let Some(child) = self.children.get(&exit.port) else {
            return;
        };
        if child.pid != exit.pid {
            return;
        }
        let stopping = child.stopping;

        if !port::wait_until_free(exit.port, GRACEFUL_WAIT).await {
            warn!(port = exit.port, "port still held after child exit");
        }
        self.children.remove(&exit.port);

        if !stopping {
            if let Some(cause) = process::exit_summary(exit.status) {
                warn!(port = exit.port, pid = exit.pid, %cause, "server exited unexpectedly");
                self.errors.insert(
                    exit.port,
                    format!(
                        "Server exited unexpectedly ({cause}); see the logs for port {}",
                        exit.port
                    ),
                );
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ApplyServers { servers, reply } => {
                let result = self.apply_servers(servers).await;
                let _ = reply.send(result);
            },
            Command::Restart { port, reply } => {
                if !self.settings.servers.iter().any(|s| s.port == port) {
                    let _ = reply.send(Err(SupervisorError::UnknownPort(port)));
                    return;
                }
                self.shutdown_child(port).await;
                let _ = reply.send(Ok(()));
            },
            Command::Purge { reply } => {
                let in_use: HashSet<String> =
                    self.children.values().map(|c| c.version.clone()).collect();
                let result = self.builds.purge(&in_use).map_err(SupervisorError::from);
                let _ = reply.send(result);
            },
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            },
            Command::StopAll { reply } => {
                let ports: Vec<u16> = self.children.keys().copied().collect();
                for port in ports {
                    self.shutdown_child(port).await;
                }
                let _ = reply.send(());
            },
        }
    }

    async fn apply_servers(&mut self, servers: Vec<DesiredServer>) -> Result<(), SupervisorError> {
        let incoming: HashMap<u16, &DesiredServer> =
            servers.iter().map(|s| (s.port, s)).collect();
        let to_stop: Vec<u16> = self
            .children
            .iter()
            .filter(|&(port, child)| match incoming.get(port) {
                None => true,
                Some(next) => {
                    !next.run || next.version != child.version || next.args != child.args
                },
            })
            .map(|(port, _)| *port)
            .collect();

        for port in to_stop {
            self.shutdown_child(port).await;
        }

        self.settings.servers = servers;
        settings::persist(&self.base, &self.settings)?;
        info!(servers = self.settings.servers.len(), "desired set updated");
        Ok(())
    }

    /// Bounded graceful-then-forceful termination, gated on port liberation.
    /// On timeout the child entry stays in place so no respawn can race the
    /// still-held port.
    async fn shutdown_child(&mut self, port: u16) {
        let Some(child) = self.children.get_mut(&port) else {
            return;
        };
        child.stopping = true;
        let pid = child.pid;
        info!(port, pid, "stopping server");

        if let Err(e) = process::send_signal(pid, Signal::SIGTERM) {
            debug!(port, pid, "SIGTERM delivery failed: {e}");
        }
        if port::wait_until_free(port, GRACEFUL_WAIT).await {
            self.children.remove(&port);
            info!(port, pid, "server stopped gracefully");
            return;
        }

        if let Err(e) = process::send_signal(pid, Signal::SIGKILL) {
            debug!(port, pid, "SIGKILL delivery failed: {e}");
        }
        if port::wait_until_free(port, KILL_WAIT).await {
            self.children.remove(&port);
            info!(port, pid, "server stopped after SIGKILL");
            return;
        }

        error!(port, pid, "port still in use after SIGKILL; keeping child entry");
        self.errors
            .insert(port, format!("Failed to free port {port} during shutdown"));
    }

    fn status(&self) -> Vec<ServerStatus> {
        self.settings
            .servers
            .iter()
            .map(|server| {
                let child = self.children.get(&server.port);
                ServerStatus {
                    server: server.clone(),
                    pid: child.map(|c| c.pid),
                    running: child.is_some(),
                    launch_error: self.errors.get(&server.port).cloned(),
                }
            })
            .collect()
    }
}
