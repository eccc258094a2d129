//! Remote execution over SSH
//!
//! Wraps the system OpenSSH client. Every command runs in a fresh session with
//! keep-alive probes enabled, so a guest that reboots mid-command shows up as a
//! lost connection within a bounded time instead of a hung channel.
//!
//! ## Exit mapping
//!
//! The OpenSSH client exits with 255 when the connection itself fails, and is
//! killed by a signal if we abort it. Both are [`RemoteExit::ConnectionLost`];
//! any other status is the remote command's own exit code.

use crate::config::{Credentials, KnownHostsPolicy, Timeouts};
use crate::error::{OrchestratorError, Result};
use crate::instance::ConnectionEndpoint;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exit status the OpenSSH client uses for its own connection failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Buffered output lines per session
const LINE_BUFFER: usize = 256;

/// How a remote command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteExit {
    /// The remote command exited with this code
    Exited(i32),
    /// The session dropped before an exit code arrived
    ConnectionLost,
}

/// A running remote command: its merged output lines and eventual exit
pub struct RemoteProcess {
    lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<RemoteExit>,
    kill: Option<oneshot::Sender<()>>,
}

/// Producer side of a [`RemoteProcess`]
pub struct ProcessHandle {
    /// Output lines, in order; dropping every sender ends the stream
    pub lines: mpsc::Sender<String>,
    /// Exit notification; dropping it unsent reads as a lost connection
    pub exit: oneshot::Sender<RemoteExit>,
    /// Fires when the consumer wants the session torn down
    pub kill: oneshot::Receiver<()>,
}

impl RemoteProcess {
    /// Create a connected process/handle pair
    pub fn channel(buffer: usize) -> (Self, ProcessHandle) {
        let (lines_tx, lines_rx) = mpsc::channel(buffer);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        (
            Self {
                lines: lines_rx,
                exit: exit_rx,
                kill: Some(kill_tx),
            },
            ProcessHandle {
                lines: lines_tx,
                exit: exit_tx,
                kill: kill_rx,
            },
        )
    }

    /// Next output line; `None` once the output stream has ended
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Ask the producer to tear the session down
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Wait up to `grace` for the exit status.
    ///
    /// Returns `None` if it did not arrive in time; the session is killed
    /// before returning.
    pub async fn wait_exit(&mut self, grace: Duration) -> Option<RemoteExit> {
        match tokio::time::timeout(grace, &mut self.exit).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(_)) => Some(RemoteExit::ConnectionLost),
            Err(_) => {
                self.kill();
                None
            }
        }
    }
}

/// Remote shell operations used by the deploy pipeline
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Write `payload` to `remote_path` and mark it executable
    async fn upload(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &[u8],
        remote_path: &str,
    ) -> Result<()>;

    /// Start `command` and stream its output
    async fn execute(&self, endpoint: &ConnectionEndpoint, command: &str) -> Result<RemoteProcess>;

    /// Whether a full session (handshake, auth, trivial command) completes within `timeout`
    async fn probe(&self, endpoint: &ConnectionEndpoint, timeout: Duration) -> Result<bool>;
}

/// [`RemoteShell`] on top of the system `ssh` binary
#[derive(Debug, Clone)]
pub struct SshShell {
    program: String,
    user: String,
    private_key: PathBuf,
    known_hosts: KnownHostsPolicy,
    connect_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_count_max: u32,
}

impl SshShell {
    /// Create a shell for `user` authenticating with `private_key`
    pub fn new(user: impl Into<String>, private_key: impl Into<PathBuf>) -> Self {
        let timeouts = Timeouts::default();
        Self {
            program: "ssh".to_string(),
            user: user.into(),
            private_key: private_key.into(),
            known_hosts: KnownHostsPolicy::default(),
            connect_timeout: timeouts.probe_attempt_timeout,
            keepalive_interval: timeouts.keepalive_interval,
            keepalive_count_max: timeouts.keepalive_count_max,
        }
    }

    /// Build from credentials and the configured timing policy
    pub fn from_credentials(credentials: &Credentials, timeouts: &Timeouts, user: &str) -> Self {
        Self::new(user, &credentials.private_key)
            .with_known_hosts(credentials.known_hosts)
            .with_connect_timeout(timeouts.probe_attempt_timeout)
            .with_keepalive(timeouts.keepalive_interval, timeouts.keepalive_count_max)
    }

    /// Set host key policy
    pub fn with_known_hosts(mut self, policy: KnownHostsPolicy) -> Self {
        self.known_hosts = policy;
        self
    }

    /// Set TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set keep-alive interval and unanswered-probe limit
    pub fn with_keepalive(mut self, interval: Duration, count_max: u32) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_count_max = count_max;
        self
    }

    /// Use a different client binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Command line an operator can paste to connect by hand
    pub fn ssh_command_hint(&self, endpoint: &ConnectionEndpoint) -> String {
        format!(
            "ssh -i {} -p {} {}@{}",
            self.private_key.display(),
            endpoint.port,
            self.user,
            endpoint.address
        )
    }

    /// Client arguments up to and including the destination
    pub(crate) fn ssh_args(&self, endpoint: &ConnectionEndpoint, connect_timeout: Duration) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.private_key.display().to_string(),
            "-p".to_string(),
            endpoint.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.keepalive_interval.as_secs().max(1)),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.keepalive_count_max),
        ];

        match self.known_hosts {
            KnownHostsPolicy::Strict => {
                args.extend(["-o".to_string(), "StrictHostKeyChecking=yes".to_string()]);
            }
            KnownHostsPolicy::AcceptNew => {
                args.extend(["-o".to_string(), "StrictHostKeyChecking=accept-new".to_string()]);
            }
            KnownHostsPolicy::Ignore => {
                args.extend([
                    "-o".to_string(),
                    "StrictHostKeyChecking=no".to_string(),
                    "-o".to_string(),
                    "UserKnownHostsFile=/dev/null".to_string(),
                ]);
            }
        }

        args.push(format!("{}@{}", self.user, endpoint.address));
        args
    }

    fn command(&self, endpoint: &ConnectionEndpoint, remote_command: &str, connect_timeout: Duration) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.ssh_args(endpoint, connect_timeout))
            .arg(remote_command)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn upload(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &[u8],
        remote_path: &str,
    ) -> Result<()> {
        let remote_command = upload_command(remote_path);
        debug!(endpoint = %endpoint, remote_path = %remote_path, bytes = payload.len(), "Uploading file");

        let mut child = self
            .command(endpoint, &remote_command, self.connect_timeout)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::remote(format!("failed to start {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload)
                .await
                .map_err(|e| OrchestratorError::remote(format!("failed to stream payload: {}", e)))?;
            stdin.shutdown().await.ok();
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OrchestratorError::remote(format!("upload session failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::remote(format!(
                "upload exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr.trim()
            )));
        }

        info!(endpoint = %endpoint, remote_path = %remote_path, "Upload complete");
        Ok(())
    }

    async fn execute(&self, endpoint: &ConnectionEndpoint, command: &str) -> Result<RemoteProcess> {
        info!(endpoint = %endpoint, command = %command, "Starting remote command");

        let mut child = self
            .command(endpoint, command, self.connect_timeout)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::remote(format!("failed to start {}: {}", self.program, e)))?;

        let (process, handle) = RemoteProcess::channel(LINE_BUFFER);
        let ProcessHandle { lines, exit, kill } = handle;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, lines.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, lines.clone()));
        }
        drop(lines);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill => {
                    debug!("Killing remote session");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let outcome = match status {
                Ok(status) => exit_from_status(status),
                Err(e) => {
                    warn!(error = %e, "Lost track of ssh client process");
                    RemoteExit::ConnectionLost
                }
            };
            let _ = exit.send(outcome);
        });

        Ok(process)
    }

    async fn probe(&self, endpoint: &ConnectionEndpoint, timeout: Duration) -> Result<bool> {
        let sentinel = format!("tdeploy-probe-{}", Uuid::new_v4());

        let child = self
            .command(endpoint, &format!("echo {}", sentinel), timeout)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| OrchestratorError::remote(format!("failed to start {}: {}", self.program, e)))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(output.status.success() && stdout.contains(&sentinel))
            }
            Ok(Err(e)) => Err(OrchestratorError::remote(format!("probe session failed: {}", e))),
            Err(_) => {
                debug!(endpoint = %endpoint, timeout = ?timeout, "Probe attempt timed out");
                Ok(false)
            }
        }
    }
}

async fn forward_lines<R>(reader: R, lines: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if lines.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}

/// Map the ssh client's exit status onto the remote command's outcome
pub(crate) fn exit_from_status(status: ExitStatus) -> RemoteExit {
    match status.code() {
        Some(SSH_CONNECTION_FAILURE) | None => RemoteExit::ConnectionLost,
        Some(code) => RemoteExit::Exited(code),
    }
}

/// Single-quote a string for a POSIX shell
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn upload_command(remote_path: &str) -> String {
    let dir = match remote_path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => ".",
    };
    format!(
        "mkdir -p {dir} && cat > {path} && chmod +x {path}",
        dir = shell_quote(dir),
        path = shell_quote(remote_path)
    )
}
