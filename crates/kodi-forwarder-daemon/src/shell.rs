//! SSH shutdown fallback
//!
//! When the host ignores the JSON-RPC shutdown request (some installations
//! disable it), the power handler falls back to opening an SSH session and
//! running the configured shutdown command under `sudo -S`, feeding the
//! elevation secret on the line after the command.
//!
//! libssh2 is synchronous, so the whole exchange runs inside
//! `spawn_blocking`; the session-level timeout bounds every network wait.

use std::io::Read;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use kodi_forwarder_config::SshConfig;

/// The closed taxonomy of transport and authentication failures the
/// fallback can surface. None of these are ever fatal to the process.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("host key verification failed: {0}")]
    BadHostKey(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no valid connection to {0}")]
    NoValidConnection(String),

    #[error("ssh protocol error: {0}")]
    Protocol(String),

    #[error("socket error: {0}")]
    Socket(String),
}

#[async_trait]
pub trait ShellEndpoint: Send + Sync {
    async fn run_privileged_shutdown(&self) -> Result<(), ShellError>;
}

pub struct SshShutdown {
    host: String,
    port: u16,
    user: String,
    password: String,
    elevation_secret: String,
    command: String,
    timeout: Duration,
}

impl SshShutdown {
    pub fn new(host: &str, ssh: &SshConfig, timeout: Duration) -> Self {
        let password = ssh.password.clone().unwrap_or_default();
        Self {
            host: host.to_string(),
            port: ssh.port,
            user: ssh.user.clone().unwrap_or_default(),
            // The login password doubles as the sudo secret; the original
            // setup uses one account for both.
            elevation_secret: password.clone(),
            password,
            command: ssh.shutdown_command.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl ShellEndpoint for SshShutdown {
    async fn run_privileged_shutdown(&self) -> Result<(), ShellError> {
        let host = self.host.clone();
        let port = self.port;
        let user = self.user.clone();
        let password = self.password.clone();
        let secret = self.elevation_secret.clone();
        let command = self.command.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            run_blocking(&host, port, &user, &password, &secret, &command, timeout)
        })
        .await
        .map_err(|e| ShellError::Protocol(format!("shutdown task failed: {e}")))?
    }
}

fn run_blocking(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    secret: &str,
    command: &str,
    timeout: Duration,
) -> Result<(), ShellError> {
    let addr = format!("{host}:{port}");
    let sock_addr = addr
        .to_socket_addrs()
        .map_err(|e| ShellError::NoValidConnection(format!("{addr}: {e}")))?
        .next()
        .ok_or_else(|| ShellError::NoValidConnection(format!("{addr}: no addresses")))?;
    let tcp = TcpStream::connect_timeout(&sock_addr, timeout)
        .map_err(|e| ShellError::NoValidConnection(format!("{addr}: {e}")))?;
    tcp.set_read_timeout(Some(timeout))
        .and_then(|_| tcp.set_write_timeout(Some(timeout)))
        .map_err(|e| ShellError::Socket(e.to_string()))?;

    let mut session =
        ssh2::Session::new().map_err(|e| ShellError::Protocol(e.message().to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis() as u32);
    session.handshake().map_err(classify_handshake)?;

    session
        .userauth_password(user, password)
        .map_err(|e| ShellError::Auth(e.message().to_string()))?;
    if !session.authenticated() {
        return Err(ShellError::Auth("server rejected credentials".to_string()));
    }

    let mut channel = session
        .channel_session()
        .map_err(|e| ShellError::Protocol(e.message().to_string()))?;

    let elevated = format!("sudo -S -p '' {command}");
    tracing::debug!("Running privileged shutdown: {}", elevated);
    channel
        .exec(&elevated)
        .map_err(|e| ShellError::Protocol(e.message().to_string()))?;

    // The elevation secret goes on the line following the command.
    channel
        .write_all(format!("{secret}\n").as_bytes())
        .map_err(|e| ShellError::Socket(e.to_string()))?;
    let _ = channel.send_eof();

    // The host may power off mid-exchange; whatever output we get is only
    // interesting for debugging.
    let mut output = String::new();
    let _ = channel.read_to_string(&mut output);
    if !output.trim().is_empty() {
        tracing::debug!("Shutdown command output: {}", output.trim());
    }
    let _ = channel.wait_close();

    Ok(())
}

fn classify_handshake(e: ssh2::Error) -> ShellError {
    let message = e.message().to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("host key") || lowered.contains("hostkey") {
        ShellError::BadHostKey(message)
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        ShellError::Socket(message)
    } else {
        ShellError::Protocol(message)
    }
}
