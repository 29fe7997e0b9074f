//! Preview server launcher.
//!
//! Spawns the site's preview command through the platform shell, forwards its
//! output to the log, and resolves once the server looks ready. The returned
//! handle owns the child process; dropping it kills the server.
//!
//! On unix the shell leads its own process group, so stopping reaches the
//! whole tree (`npm` → `sh` → `node`), not just the shell.

use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::ExportError;

const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// How long the group gets to exit on SIGTERM before it is killed.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_secs(3);
/// How long `stop` waits for the killed process to be reaped.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How the launcher decides the server is accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// First stdout line mentioning `Local` or the port number.
    ///
    /// Package runners echo the command line (`> astro preview --port 4321`)
    /// before the server listens, which already matches. Use `HttpProbe`
    /// (`CV_READINESS=http`) when the stabilization delay is not enough.
    StdoutMarker,
    /// Any HTTP response from `http://localhost:<port>/`.
    HttpProbe,
}

impl FromStr for Readiness {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdout" => Ok(Readiness::StdoutMarker),
            "http" => Ok(Readiness::HttpProbe),
            other => bail!("CV_READINESS must be 'stdout' or 'http', got '{other}'"),
        }
    }
}

/// Returns true when a line of server output announces the local address.
pub fn signals_ready(line: &str, port: u16) -> bool {
    line.contains("Local") || line.contains(&port.to_string())
}

// ────────────────────────────────────────────────────────────────────────────
// Traits
// ────────────────────────────────────────────────────────────────────────────

/// Starts the content server. One call per run.
#[async_trait]
pub trait PreviewServer: Send + Sync {
    async fn start(&self) -> Result<Box<dyn ServerHandle>, ExportError>;
}

/// Stop-capability for a running server. `stop` must be safe to call repeatedly.
#[async_trait]
pub trait ServerHandle: Send {
    async fn stop(&mut self);
}

// ────────────────────────────────────────────────────────────────────────────
// CommandServer — shell command child process
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommandServer {
    command: String,
    port: u16,
    startup_timeout: Duration,
    readiness: Readiness,
}

impl CommandServer {
    pub fn new(config: &Config) -> Self {
        Self::with_command(
            config.resolved_server_command(),
            config.port,
            config.startup_timeout,
            config.readiness,
        )
    }

    pub fn with_command(
        command: impl Into<String>,
        port: u16,
        startup_timeout: Duration,
        readiness: Readiness,
    ) -> Self {
        Self {
            command: command.into(),
            port,
            startup_timeout,
            readiness,
        }
    }

    /// Spawns the server and waits for readiness, bounded by the startup timeout.
    /// On any failure the child is killed before returning.
    pub async fn launch(&self) -> Result<ChildServer, ExportError> {
        info!("Starting preview server: {}", self.command);

        let mut command = shell_command(&self.command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(ExportError::Spawn)?;
        // The shell's pid doubles as the process group id
        let group = child.id();

        let marker = child
            .stdout
            .take()
            .map(|stdout| watch_stdout(stdout, self.port));
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let outcome = timeout(
            self.startup_timeout,
            self.wait_until_ready(&mut child, marker),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!("Server started successfully");
                Ok(ChildServer {
                    child,
                    group,
                    stopped: false,
                })
            }
            Ok(Err(e)) => {
                reap(&mut child, group).await;
                Err(e)
            }
            Err(_) => {
                reap(&mut child, group).await;
                Err(ExportError::StartupTimeout(self.startup_timeout))
            }
        }
    }

    async fn wait_until_ready(
        &self,
        child: &mut Child,
        marker: Option<oneshot::Receiver<()>>,
    ) -> Result<(), ExportError> {
        let ready = async {
            match (self.readiness, marker) {
                (Readiness::StdoutMarker, Some(rx)) => {
                    // stdout closed without the marker: only exit or timeout can end the wait
                    if rx.await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                (Readiness::StdoutMarker, None) => std::future::pending::<()>().await,
                (Readiness::HttpProbe, _) => probe_http(self.port).await,
            }
        };

        tokio::select! {
            biased;
            _ = ready => Ok(()),
            status = child.wait() => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                Err(ExportError::ServerExited(status))
            }
        }
    }
}

#[async_trait]
impl PreviewServer for CommandServer {
    async fn start(&self) -> Result<Box<dyn ServerHandle>, ExportError> {
        Ok(Box::new(self.launch().await?))
    }
}

/// A running preview server. Killed on `stop` or, failing that, on drop.
#[derive(Debug)]
pub struct ChildServer {
    child: Child,
    group: Option<u32>,
    stopped: bool,
}

#[async_trait]
impl ServerHandle for ChildServer {
    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!("Stopping server...");
        reap(&mut self.child, self.group).await;
    }
}

impl Drop for ChildServer {
    fn drop(&mut self) {
        // kill_on_drop only reaches the shell
        #[cfg(unix)]
        {
            if let (false, Some(pgid)) = (self.stopped, self.group) {
                let _ = signal_group(pgid, libc::SIGKILL);
            }
        }
    }
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

#[cfg(not(windows))]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: killpg takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// SIGTERM to the whole group, a grace period, then SIGKILL for whatever is left.
#[cfg(unix)]
async fn terminate_group(child: &mut Child, group: Option<u32>) {
    let Some(pgid) = group else {
        return;
    };
    if let Err(e) = signal_group(pgid, libc::SIGTERM) {
        debug!("SIGTERM to server process group {pgid} failed: {e}");
    }
    if timeout(TERM_GRACE, child.wait()).await.is_err() {
        debug!("Server process group {pgid} ignored SIGTERM");
    }
    // Descendants may outlive the shell; ESRCH here means the group is already empty
    if let Err(e) = signal_group(pgid, libc::SIGKILL) {
        debug!("SIGKILL to server process group {pgid}: {e}");
    }
}

#[cfg(not(unix))]
async fn terminate_group(_child: &mut Child, _group: Option<u32>) {}

async fn reap(child: &mut Child, group: Option<u32>) {
    terminate_group(child, group).await;
    if let Err(e) = child.start_kill() {
        debug!("Server process already gone: {e}");
    }
    match timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("Server process exited: {status}"),
        Ok(Err(e)) => warn!("Failed to reap server process: {e}"),
        Err(_) => warn!("Server process did not exit within {}s", STOP_GRACE.as_secs()),
    }
}

/// Forwards stdout lines to the log and fires the returned receiver on the
/// first line that signals readiness. The receiver errors if stdout closes first.
fn watch_stdout<R>(reader: R, port: u16) -> oneshot::Receiver<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut tx = Some(tx);
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!("{line}");
                    if signals_ready(&line, port) {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(());
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Stopped reading server stdout: {e}");
                    break;
                }
            }
        }
    });
    rx
}

fn forward_stderr<R>(reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!("Server error: {line}");
        }
    });
}

async fn probe_http(port: u16) {
    let url = format!("http://localhost:{port}/");
    let client = reqwest::Client::new();
    loop {
        match client
            .get(&url)
            .timeout(PROBE_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => {
                debug!("Health probe answered {}", response.status());
                return;
            }
            Err(e) => debug!("Health probe not ready: {e}"),
        }
        sleep(PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_local_marker_signals_ready() {
        assert!(signals_ready("  ┃ Local    http://localhost:4321/", 4321));
    }

    #[test]
    fn test_port_number_signals_ready() {
        assert!(signals_ready("listening on 127.0.0.1:4321", 4321));
    }

    #[test]
    fn test_unrelated_output_is_not_ready() {
        assert!(!signals_ready("> astro preview", 4321));
        assert!(!signals_ready("building pages...", 4321));
    }

    #[test]
    fn test_readiness_parses() {
        assert_eq!("stdout".parse::<Readiness>().unwrap(), Readiness::StdoutMarker);
        assert_eq!(" HTTP ".parse::<Readiness>().unwrap(), Readiness::HttpProbe);
        assert!("socket".parse::<Readiness>().is_err());
    }

    #[tokio::test]
    async fn test_watch_stdout_fires_on_marker() {
        let output = Cursor::new(b"> preview\n  Local: http://localhost:4321/\nmore\n".to_vec());
        let rx = watch_stdout(output, 4321);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_stdout_errors_when_output_ends_without_marker() {
        let output = Cursor::new(b"> preview\nbuilding...\n".to_vec());
        let rx = watch_stdout(output, 4321);
        assert!(rx.await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_resolves_on_marker_and_stop_is_idempotent() {
        let server = CommandServer::with_command(
            "echo 'Local: http://localhost:4321/'; sleep 30",
            4321,
            Duration::from_secs(10),
            Readiness::StdoutMarker,
        );
        let mut handle = server.launch().await.unwrap();

        handle.stop().await;
        assert!(handle.stopped);
        assert!(handle.child.try_wait().unwrap().is_some());

        // Second stop is a no-op
        handle.stop().await;
        assert!(handle.stopped);
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        // Zombies have an empty cmdline
        std::fs::read(format!("/proc/{pid}/cmdline"))
            .map(|cmdline| !cmdline.is_empty())
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_terminates_background_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let server = CommandServer::with_command(
            format!(
                "sleep 4242 & echo $! > '{}'; echo 'Local: http://localhost:4321/'; wait",
                pid_file.display()
            ),
            4321,
            Duration::from_secs(10),
            Readiness::StdoutMarker,
        );
        let mut handle = server.launch().await.unwrap();

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        assert!(is_running(&pid), "grandchild {pid} should be up before stop");

        handle.stop().await;

        let mut gone = false;
        for _ in 0..40 {
            if !is_running(&pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "grandchild {pid} still running after stop");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_times_out_without_marker() {
        let server = CommandServer::with_command(
            "sleep 30",
            4321,
            Duration::from_millis(300),
            Readiness::StdoutMarker,
        );
        let err = server.launch().await.unwrap_err();
        assert!(matches!(err, ExportError::StartupTimeout(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_fails_fast_when_server_exits() {
        let server = CommandServer::with_command(
            "echo 'crashing'; exit 3",
            4321,
            Duration::from_secs(10),
            Readiness::StdoutMarker,
        );
        let err = server.launch().await.unwrap_err();
        assert!(matches!(err, ExportError::ServerExited(_)), "got {err:?}");
        assert!(err.is_startup_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_executable_is_a_startup_failure() {
        let server = CommandServer::with_command(
            "definitely-not-a-real-preview-command-xyz",
            4321,
            Duration::from_secs(10),
            Readiness::StdoutMarker,
        );
        let err = server.launch().await.unwrap_err();
        assert!(err.is_startup_failure(), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_http_probe_readiness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });

        let server = CommandServer::with_command(
            "sleep 30",
            port,
            Duration::from_secs(10),
            Readiness::HttpProbe,
        );
        let mut handle = server.launch().await.unwrap();
        handle.stop().await;
    }
}
