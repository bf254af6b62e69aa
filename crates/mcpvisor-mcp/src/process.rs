//! Worker process spawning, monitoring and graceful shutdown.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use mcpvisor_config::EnvOverlay;
use mcpvisor_core::{ExitInfo, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use crate::transport::StdioChannel;

/// A freshly spawned worker, before its startup grace period.
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
    /// Attached to the worker's stdin/stdout from the start so stdout is always drained.
    pub channel: Arc<StdioChannel>,
}

/// Spawn `config` with piped stdio.
///
/// The environment is the process environment, then the overlay, then the
/// entry's own `env` (later wins). Stderr lines are forwarded to `tracing`.
pub fn spawn(config: &ServerConfig, overlay: &EnvOverlay) -> io::Result<SpawnedProcess> {
    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .envs(overlay.vars())
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn()?;

    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("spawned process has no PID"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("failed to capture stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("failed to capture stdout"))?;
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_reader(stderr, config.name.clone());
    }

    let channel = Arc::new(StdioChannel::spawn(config.name.clone(), stdout, stdin));

    debug!(server_name = %config.name, pid, command = %config.command, "Spawned worker process");

    Ok(SpawnedProcess {
        child,
        pid,
        channel,
    })
}

/// Wait out the startup grace period.
///
/// Returns the exit status if the process died within `grace`, `None` if it is still alive.
pub async fn wait_startup(child: &mut Child, grace: Duration) -> Option<ExitInfo> {
    tokio::select! {
        status = child.wait() => Some(exit_info(status)),
        () = tokio::time::sleep(grace) => None,
    }
}

/// Handle to a running worker's monitor task.
///
/// The monitor owns the `Child`. It reports a natural exit through the
/// `on_exit` callback; a stop request instead runs SIGTERM → SIGKILL.
pub struct WorkerProcess {
    pid: u32,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<ExitInfo>>,
}

impl WorkerProcess {
    /// Start monitoring a child that survived its grace period.
    pub fn monitor<F>(mut child: Child, pid: u32, stop_timeout: Duration, on_exit: F) -> Self
    where
        F: FnOnce(ExitInfo) + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let monitor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let info = exit_info(status);
                    on_exit(info);
                    info
                }
                // A dropped handle counts as a stop request.
                _ = stop_rx => {
                    match shutdown_child(&mut child, stop_timeout).await {
                        Ok(status) => ExitInfo::from_status(status),
                        Err(e) => {
                            warn!(pid, error = %e, "Failed to shut down worker process");
                            ExitInfo::default()
                        }
                    }
                }
            }
        });

        Self {
            pid,
            stop_tx: Some(stop_tx),
            monitor: Some(monitor),
        }
    }

    /// Terminate the process (if still alive) and wait until it is reaped.
    pub async fn stop(mut self) -> ExitInfo {
        if let Some(tx) = self.stop_tx.take() {
            // Fails only if the process already exited on its own.
            let _ = tx.send(());
        }
        match self.monitor.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!(pid = self.pid, error = %e, "Worker monitor task failed");
                ExitInfo::default()
            }),
            None => ExitInfo::default(),
        }
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

fn exit_info(status: io::Result<ExitStatus>) -> ExitInfo {
    match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            warn!(error = %e, "Failed to wait for worker process");
            ExitInfo::default()
        }
    }
}

/// Gracefully shut down a child process with SIGTERM, escalating to SIGKILL
/// after `timeout`. Always waits for reaping.
pub async fn shutdown_child(child: &mut Child, timeout: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        shutdown_unix(child, timeout).await
    }

    #[cfg(not(unix))]
    {
        let _ = timeout;
        child.kill().await?;
        child.wait().await
    }
}

#[cfg(unix)]
async fn shutdown_unix(child: &mut Child, timeout: Duration) -> io::Result<ExitStatus> {
    // Already reaped
    let Some(pid) = child.id() else {
        return child.wait().await;
    };
    let pid = i32::try_from(pid).map_err(io::Error::other)?;

    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    if let Ok(result) = tokio::time::timeout(timeout, child.wait()).await {
        return result;
    }

    debug!(pid, "Worker ignored SIGTERM, sending SIGKILL");
    child.kill().await?;
    child.wait().await
}

/// Forward a worker's stderr to `tracing`, decoding lossily.
fn spawn_stderr_reader(stream: impl AsyncRead + Unpin + Send + 'static, server_name: String) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        debug!(server_name = %server_name, "stderr: {}", line);
                    }
                }
                Err(e) => {
                    debug!(server_name = %server_name, error = %e, "stderr reader exiting due to read error");
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn config(command: &str, args: &[&str]) -> ServerConfig {
        ServerConfig::new("t", command).with_args(args.iter().copied())
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_binary() {
        let overlay = EnvOverlay::from_vars(Vec::<(String, String)>::new());
        let result = spawn(&config("/nonexistent/mcpvisor-worker", &[]), &overlay);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_early_exit_detected_during_grace() {
        let overlay = EnvOverlay::from_vars(Vec::<(String, String)>::new());
        let mut proc = spawn(&config("sh", &["-c", "exit 3"]), &overlay).unwrap();
        let exit = wait_startup(&mut proc.child, Duration::from_secs(2)).await;
        assert_eq!(exit, Some(ExitInfo::with_code(3)));
    }

    #[tokio::test]
    async fn test_entry_env_overrides_overlay() {
        let overlay = EnvOverlay::from_vars([("A", "overlay"), ("B", "overlay")]);
        let cfg = config("sh", &["-c", r#"test "$A" = overlay && test "$B" = entry"#])
            .with_env("B", "entry");
        let mut proc = spawn(&cfg, &overlay).unwrap();
        let exit = wait_startup(&mut proc.child, Duration::from_secs(5)).await;
        assert_eq!(exit, Some(ExitInfo::with_code(0)));
    }

    #[tokio::test]
    async fn test_stop_terminates_with_sigterm() {
        let overlay = EnvOverlay::from_vars(Vec::<(String, String)>::new());
        let mut proc = spawn(&config("sleep", &["30"]), &overlay).unwrap();
        assert!(wait_startup(&mut proc.child, Duration::from_millis(100)).await.is_none());

        let exits = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&exits);
        let worker = WorkerProcess::monitor(proc.child, proc.pid, Duration::from_secs(5), move |e| {
            seen.lock().unwrap().push(e);
        });

        let exit = worker.stop().await;
        assert_eq!(exit, ExitInfo::with_signal(15));
        // Requested stops do not go through the exit callback
        assert!(exits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let overlay = EnvOverlay::from_vars(Vec::<(String, String)>::new());
        let mut proc = spawn(
            &config("sh", &["-c", "trap '' TERM; while true; do sleep 0.1; done"]),
            &overlay,
        )
        .unwrap();
        assert!(wait_startup(&mut proc.child, Duration::from_millis(200)).await.is_none());

        let worker = WorkerProcess::monitor(proc.child, proc.pid, Duration::from_millis(300), |_| {});
        let exit = worker.stop().await;
        assert_eq!(exit, ExitInfo::with_signal(9));
    }

    #[tokio::test]
    async fn test_natural_exit_invokes_callback() {
        let overlay = EnvOverlay::from_vars(Vec::<(String, String)>::new());
        let proc = spawn(&config("sh", &["-c", "sleep 0.2; exit 1"]), &overlay).unwrap();

        let (tx, rx) = oneshot::channel();
        let _worker = WorkerProcess::monitor(proc.child, proc.pid, Duration::from_secs(5), move |e| {
            let _ = tx.send(e);
        });
        let exit = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(exit, ExitInfo::with_code(1));
    }
}
