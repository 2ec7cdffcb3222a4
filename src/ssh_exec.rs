//! Remote command execution on pods.
//!
//! Unique responsibility: run setup commands on a pod over SSH.
//!
//! The dispatcher talks to freshly rented instances whose host keys are
//! never known in advance, so host-key checking is off and authentication
//! uses one fixed private key as `root`. The blocking `ssh2` session runs
//! on the blocking thread pool.
//!
//! `CommandRunner` is the seam the pod code depends on; tests substitute
//! an in-process fake for it.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use thiserror::Error;
use tracing::debug;

use crate::config::DispatcherConfig;

/// Captured output of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output of the command.
    pub stdout: String,
    /// Standard error of the command.
    pub stderr: String,
    /// Exit status of the command.
    pub exit_code: i32,
}

impl CommandOutput {
    /// True if the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run a shell command on a remote host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` on `host:port` and capture its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, authentication or channel
    /// setup fails. A non-zero exit status is not an error here; callers
    /// inspect [`CommandOutput::success`].
    async fn run(&self, cmd: &str, host: &str, port: u16) -> Result<CommandOutput, SshError>;
}

/// SSH-backed command runner using a fixed private key.
pub struct SshExec {
    key_path: PathBuf,
    user: String,
    connect_timeout: Duration,
}

impl SshExec {
    /// Create a runner with the configured key, as `root`.
    #[must_use]
    pub fn new(cfg: &DispatcherConfig) -> Self {
        Self {
            key_path: cfg.ssh_key_path.clone(),
            user: "root".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl CommandRunner for SshExec {
    async fn run(&self, cmd: &str, host: &str, port: u16) -> Result<CommandOutput, SshError> {
        let cmd = cmd.to_string();
        let host_owned = host.to_string();
        let user = self.user.clone();
        let key_path = self.key_path.clone();
        let connect_timeout = self.connect_timeout;

        let output = tokio::task::spawn_blocking(move || {
            run_blocking(&cmd, &host_owned, port, &user, &key_path, connect_timeout)
        })
        .await
        .map_err(|_| SshError::TaskAborted)??;

        debug!(%host, port, exit_code = output.exit_code, "remote command finished");
        Ok(output)
    }
}

/// One blocking SSH exchange: connect, authenticate, exec, collect.
fn run_blocking(
    cmd: &str,
    host: &str,
    port: u16,
    user: &str,
    key_path: &Path,
    connect_timeout: Duration,
) -> Result<CommandOutput, SshError> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| SshError::Resolve(host.to_string()))?;
    let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(stream);
    session.handshake()?;
    session.userauth_pubkey_file(user, None, key_path, None)?;

    let mut channel = session.channel_session()?;
    channel.exec(cmd)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Error type for remote execution.
#[derive(Debug, Error)]
pub enum SshError {
    /// Socket-level failure (connect, resolve, read).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The host name did not resolve to an address.
    #[error("could not resolve host {0}")]
    Resolve(String),
    /// SSH protocol or authentication failure.
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    /// The blocking task running the session was aborted.
    #[error("ssh task aborted")]
    TaskAborted,
}
