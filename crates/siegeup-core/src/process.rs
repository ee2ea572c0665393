//! Child process spawning and termination.
//!
//! A spawned server is tracked by port and OS pid. The `tokio` child handle
//! itself is owned by a per-child monitor task that pumps both output
//! streams into the launch's log file and reports the exit; the supervisor
//! signals the child by pid.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::logs::{self, LogFile};
use crate::settings::DesiredServer;

/// Budget for the graceful (SIGTERM) stage of shutdown.
pub const GRACEFUL_WAIT: Duration = Duration::from_millis(2000);

/// Budget for the forceful (SIGKILL) stage of shutdown.
pub const KILL_WAIT: Duration = Duration::from_millis(1000);

/// Environment overlay applied to every child on top of the inherited
/// environment.
pub const ENV_OVERLAY: &[(&str, &str)] = &[("LANG", "C.UTF-8"), ("SIEGEUP_MANAGED", "1")];

/// Errors from spawning a server process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The executable could not be started.
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        /// Executable path.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The OS did not report a pid for the spawned child.
    #[error("spawned process reported no pid")]
    NoPid,
}

/// Volatile record of one live child, keyed by port in the supervisor.
#[derive(Debug, Clone)]
pub struct ChildInstance {
    /// OS process id.
    pub pid: u32,
    /// Build version at spawn time.
    pub version: String,
    /// Extra arguments at spawn time.
    pub args: Vec<String>,
    /// Spawn timestamp.
    pub spawned_at: DateTime<Utc>,
    /// Set while an agent-initiated shutdown is in progress; suppresses the
    /// abnormal-exit diagnostic for this child.
    pub stopping: bool,
}

/// Exit report delivered by a monitor task.
#[derive(Debug)]
pub struct ChildExit {
    /// Port the child was serving.
    pub port: u16,
    /// OS pid of the exited child.
    pub pid: u32,
    /// Exit status; `None` when the wait itself failed.
    pub status: Option<std::process::ExitStatus>,
}

/// Canonical argument vector for a server on `port`.
#[must_use]
pub fn server_args(port: u16, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "-batchmode".to_string(),
        "-nographics".to_string(),
        "-logFile".to_string(),
        "-".to_string(),
        "--server-port".to_string(),
        port.to_string(),
    ];
    args.extend_from_slice(extra);
    args
}

/// Spawns the server described by `desired` from `executable`, wiring both
/// output streams through timestamping into `log_file`, and starts a monitor
/// task that reports the exit on `exit_tx`.
///
/// The working directory is the executable's containing directory.
///
/// # Errors
///
/// Returns an error when the process cannot be started or reports no pid.
pub fn spawn(
    desired: &DesiredServer,
    executable: &Path,
    log_file: LogFile,
    exit_tx: mpsc::Sender<ChildExit>,
) -> Result<ChildInstance, SpawnError> {
    let mut cmd = Command::new(executable);
    cmd.args(server_args(desired.port, &desired.args))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    if let Some(dir) = executable.parent() {
        cmd.current_dir(dir);
    }
    for (key, value) in ENV_OVERLAY {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
        path: executable.display().to_string(),
        source,
    })?;
    let pid = child.id().ok_or(SpawnError::NoPid)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let port = desired.port;
    tokio::spawn(async move {
        let (_, _, status) = tokio::join!(
            pump_opt(stdout, Arc::clone(&log_file)),
            pump_opt(stderr, Arc::clone(&log_file)),
            child.wait(),
        );
        let _ = exit_tx
            .send(ChildExit {
                port,
                pid,
                status: status.ok(),
            })
            .await;
    });

    Ok(ChildInstance {
        pid,
        version: desired.version.clone(),
        args: desired.args.clone(),
        spawned_at: Utc::now(),
        stopping: false,
    })
}

async fn pump_opt<R>(stream: Option<R>, file: LogFile)
where
    R: AsyncRead + Unpin,
{
    if let Some(stream) = stream {
        logs::pump(stream, file).await;
    }
}

/// Sends `signal` to `pid`. Delivery failure is not fatal to supervision:
/// the port probe remains the authority on whether the child is gone.
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::errno::Errno> {
    kill(Pid::from_raw(pid as i32), signal)
}

/// Describes an abnormal exit, or `None` for a clean exit with code 0.
#[must_use]
pub fn exit_summary(status: Option<std::process::ExitStatus>) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let Some(status) = status else {
        return Some("unknown exit status".to_string());
    };
    if status.success() {
        return None;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Some(format!("exit code {code}")),
        (None, Some(signal)) => Some(format!("signal {signal}")),
        (None, None) => Some("unknown exit status".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex;

    use super::*;
    use crate::settings::DesiredServer;

    fn desired(port: u16) -> DesiredServer {
        DesiredServer {
            name: "Server 1".to_string(),
            version: "v1".to_string(),
            port,
            args: vec!["--map".to_string(), "island".to_string()],
            visible: true,
            run: true,
        }
    }

    async fn log_file(dir: &Path) -> LogFile {
        let file = tokio::fs::File::create(dir.join("test.log")).await.unwrap();
        Arc::new(Mutex::new(file))
    }

    #[test]
    fn test_server_args_layout() {
        let args = server_args(9001, &["--map".to_string(), "island".to_string()]);
        assert_eq!(
            args,
            vec![
                "-batchmode",
                "-nographics",
                "-logFile",
                "-",
                "--server-port",
                "9001",
                "--map",
                "island",
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let result = spawn(
            &desired(9001),
            Path::new("/nonexistent/server.x86_64"),
            log_file(dir.path()).await,
            tx,
        );
        assert!(matches!(result, Err(SpawnError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_spawn_reports_exit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.x86_64");
        std::fs::write(&script, "#!/bin/sh\necho up\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let child = spawn(&desired(9001), &script, log_file(dir.path()).await, tx).unwrap();
        assert!(child.pid > 0);
        assert!(!child.stopping);

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.port, 9001);
        assert_eq!(exit.pid, child.pid);
        assert_eq!(exit.status.unwrap().code(), Some(3));

        let log = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert!(log.contains("up"));
    }

    #[test]
    fn test_exit_summary() {
        use std::os::unix::process::ExitStatusExt;

        assert!(exit_summary(Some(std::process::ExitStatus::from_raw(0))).is_none());
        assert_eq!(
            exit_summary(Some(std::process::ExitStatus::from_raw(0x100))).as_deref(),
            Some("exit code 1")
        );
        assert_eq!(
            exit_summary(Some(std::process::ExitStatus::from_raw(9))).as_deref(),
            Some("signal 9")
        );
        assert_eq!(
            exit_summary(None).as_deref(),
            Some("unknown exit status")
        );
    }
}
