//! Configuration data model

use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub kodi: KodiConfig,
    pub timing: TimingConfig,
}

/// The paired input controller and the mapping pack to use for it
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Physical address of the paired controller, matched against the
    /// evdev `phys` attribute (e.g., "aa:bb:cc:dd:ee:ff")
    pub identity: String,
    /// Name of the mapping document to load
    pub mapping: String,
    /// Directory scanned for mapping documents
    pub mappings_dir: PathBuf,
}

/// The media-center host endpoints and credentials
#[derive(Debug, Clone)]
pub struct KodiConfig {
    pub host: String,
    /// HTTP port of the JSON-RPC interface
    pub web_port: u16,
    /// UDP port of the event server
    pub eventserver_port: u16,
    /// Credentials for the JSON-RPC interface, if it requires them
    pub user: Option<String>,
    pub password: Option<String>,
    /// Link-layer address used for wake-on-LAN power-on
    pub mac: Option<String>,
    pub ssh: SshConfig,
}

impl Default for KodiConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            web_port: 8080,
            eventserver_port: 9777,
            user: None,
            password: None,
            mac: None,
            ssh: SshConfig::default(),
        }
    }
}

/// SSH credentials for the privileged-shutdown fallback
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Command run under `sudo -S` on the host
    pub shutdown_command: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            user: None,
            password: None,
            shutdown_command: "/sbin/shutdown -h now".to_string(),
        }
    }
}

/// Timing knobs for the forwarding engine. Every field has a default; the
/// config file only needs to name the ones it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Minimum press-to-release spacing enforced by the dispatcher
    pub debounce: Duration,
    /// How often the poller probes a connected host
    pub liveness_interval: Duration,
    /// How often the open event-server session is pinged
    pub keepalive_interval: Duration,
    /// Minimum re-trigger interval for power commands
    pub command_cooldown: Duration,
    /// Delay before retrying controller acquisition after a loss
    pub reacquire_delay: Duration,
    /// Timeout applied to every outbound network call
    pub io_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(40),
            liveness_interval: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(50),
            command_cooldown: Duration::from_secs(30),
            reacquire_delay: Duration::from_millis(500),
            io_timeout: Duration::from_secs(3),
        }
    }
}
