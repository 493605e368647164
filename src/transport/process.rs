//! Supervised server process
//!
//! A monitor task owns the [`Child`]. It either observes an unexpected exit
//! and reports [`LinkEvent::ProcessExited`], or receives a stop request and
//! runs SIGTERM, a grace period, then SIGKILL. Dropping a [`ChildProcess`]
//! counts as a stop request, so abandoned handles are still reaped.

use crate::transport::traits::LinkEvent;
use crate::utils::errors::{McpError, McpResult};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(2000);

/// What to launch for one server
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Handle to a spawned server process
pub struct ChildProcess {
    server: String,
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ChildProcess {
    /// Spawn the process with piped stdio.
    ///
    /// The child inherits the ambient environment with `spec.env` layered on
    /// top. Returns the handle plus the pipes the stdio transport talks over.
    pub fn spawn(
        server: &str,
        spec: &ProcessSpec,
        events: mpsc::Sender<LinkEvent>,
        grace: Duration,
    ) -> McpResult<(Self, ChildStdin, ChildStdout)> {
        let program = which::which(&spec.command).map_err(|e| {
            McpError::connect(server, format!("command '{}' not found: {}", spec.command, e))
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connect(server, format!("failed to spawn '{}': {}", program.display(), e))
        })?;

        let pid = child.id();
        info!(server, pid = ?pid, command = %program.display(), "Spawned MCP server process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connect(server, "failed to open stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connect(server, "failed to open stdout"))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {}", line);
                }
            })
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(server.to_string(), child, stop_rx, events, grace));

        Ok((
            Self {
                server: server.to_string(),
                pid,
                stop_tx: Some(stop_tx),
                monitor: Some(monitor),
                stderr_task,
            },
            stdin,
            stdout,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the process and wait until it has been reaped.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                warn!(server = %self.server, "Process monitor task failed: {}", e);
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Dropping stop_tx wakes the monitor, which then terminates the child.
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

async fn monitor(
    server: String,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<LinkEvent>,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.as_ref().ok().and_then(|s| s.code());
            warn!(server = %server, ?code, "MCP server process exited unexpectedly");
            let _ = events.send(LinkEvent::ProcessExited { code }).await;
        }
        _ = stop_rx => {
            terminate(&server, &mut child, grace).await;
        }
    }
}

async fn terminate(server: &str, child: &mut Child, grace: Duration) {
    send_sigterm(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(server, "Process exited with: {:?}", status),
        Ok(Err(e)) => warn!(server, "Failed to wait for process: {}", e),
        Err(_) => {
            warn!(server, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(server, "Failed to kill process: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, "SIGTERM failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}
