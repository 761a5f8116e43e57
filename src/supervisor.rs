//! Process launching and supervision plumbing.
//!
//! The engine launches daemons through the [`Launcher`] trait. The
//! system-backed implementation spawns via `tokio::process` and attaches
//! a monitor task per child; when the child exits (normally or on a
//! signal) the monitor delivers an [`ExitEvent`] carrying the binary
//! path back to the single control loop over a channel, which is where
//! the respawn decision is made.

use crate::daemons::DaemonSpec;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Pid, User};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why a supervised process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Normal exit with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled(i32),
}

/// Delivered to the control loop when a supervised daemon stops.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    /// Binary path keying the running-process record
    pub binary: PathBuf,
    /// Why the process stopped
    pub cause: ExitCause,
}

/// A running-process record. One concurrent instance per binary path.
#[derive(Debug, Clone)]
pub struct RunningProc {
    /// Process ID at launch
    pub pid: u32,
    /// When the process was launched
    pub started_at: DateTime<Utc>,
}

impl RunningProc {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
        }
    }
}

/// Process-spawning collaborator.
#[async_trait]
pub trait Launcher: Send {
    /// Configure and launch a daemon. Exit notification for the spawned
    /// process is delivered through `exit_tx`.
    async fn launch(&mut self, daemon: &DaemonSpec, exit_tx: mpsc::Sender<ExitEvent>)
        -> Result<u32>;

    /// Run a short-lived helper to completion. Returns whether it
    /// exited successfully.
    async fn run_oneshot(&mut self, program: &str, args: &[&str]) -> Result<bool>;
}

/// Launcher backed by `tokio::process`.
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Resolve a run-as user name to uid/gid.
    fn resolve_user(name: &str) -> Result<(u32, u32)> {
        let user = User::from_name(name)?.ok_or_else(|| Error::UserNotFound(name.to_string()))?;
        Ok((user.uid.as_raw(), user.gid.as_raw()))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &mut self,
        daemon: &DaemonSpec,
        exit_tx: mpsc::Sender<ExitEvent>,
    ) -> Result<u32> {
        let mut cmd = Command::new(&daemon.binary);
        cmd.args(daemon.args.split_whitespace())
            .stdin(Stdio::null())
            .env(
                "PATH",
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
            );

        if let Some(ref name) = daemon.user {
            let (uid, gid) = Self::resolve_user(name)?;
            cmd.uid(uid).gid(gid);
        }

        let mut child = cmd.spawn().map_err(|e| Error::LaunchFailed {
            binary: daemon.binary.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().unwrap_or(0);
        info!(binary = %daemon.binary.display(), pid = pid, "Launched daemon");

        let binary = daemon.binary.clone();
        tokio::spawn(async move {
            let cause = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => ExitCause::Exited(code),
                    None => ExitCause::Signaled(status.signal().unwrap_or(0)),
                },
                Err(e) => {
                    warn!(binary = %binary.display(), error = %e, "Failed to wait on daemon");
                    ExitCause::Exited(-1)
                }
            };
            let _ = exit_tx.send(ExitEvent { binary, cause }).await;
        });

        Ok(pid)
    }

    async fn run_oneshot(&mut self, program: &str, args: &[&str]) -> Result<bool> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::LaunchFailed {
                binary: PathBuf::from(program),
                reason: e.to_string(),
            })?;
        Ok(status.success())
    }
}

/// Reap any zombie processes (PID 1 duty), logging each one.
///
/// Children spawned through the launcher are collected by their monitor
/// tasks; this sweeps up orphans re-parented to init.
pub fn reap_zombies() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code = code, "Reaped zombie process");
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                debug!(pid = pid.as_raw(), signal = ?sig, "Reaped signaled process");
            }
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Error reaping zombies");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemons::ReadyCheck;
    use std::time::Duration;

    fn spec(binary: &str, args: &str) -> DaemonSpec {
        DaemonSpec {
            name: format!("start {}", binary),
            binary: PathBuf::from(binary),
            args: args.to_string(),
            user: None,
            ready: ReadyCheck::None,
            fatal: false,
        }
    }

    #[test]
    fn test_running_proc_records_start_time() {
        let before = Utc::now();
        let record = RunningProc::new(42);
        let after = Utc::now();
        assert_eq!(record.pid, 42);
        assert!(record.started_at >= before && record.started_at <= after);
    }

    #[tokio::test]
    async fn test_run_oneshot_reports_exit_status() {
        let mut launcher = ProcessLauncher;
        assert!(launcher.run_oneshot("true", &[]).await.unwrap());
        assert!(!launcher.run_oneshot("false", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_oneshot_missing_binary() {
        let mut launcher = ProcessLauncher;
        let err = launcher
            .run_oneshot("/nonexistent/helper", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_launch_delivers_exit_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut launcher = ProcessLauncher;
        launcher.launch(&spec("true", ""), tx).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.binary, PathBuf::from("true"));
        assert_eq!(event.cause, ExitCause::Exited(0));
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let (tx, _rx) = mpsc::channel(4);
        let mut launcher = ProcessLauncher;
        let err = launcher
            .launch(&spec("/nonexistent/daemon", "-f"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { .. }));
    }
}
