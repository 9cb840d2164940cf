//! KDL configuration parser

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::*;

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl uses an older miette version, so extract offset/len manually
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "controller" => {
                config.controller = parse_controller(node)?;
            }
            "kodi" => {
                config.kodi = parse_kodi(node)?;
            }
            "timing" => {
                config.timing = parse_timing(node)?;
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.controller.identity.is_empty() {
        return Err(ConfigError::MissingField {
            field: "controller.identity (physical address of the paired remote)".to_string(),
        });
    }
    if config.controller.mapping.is_empty() {
        return Err(ConfigError::MissingField {
            field: "controller.mapping (name of the mapping document)".to_string(),
        });
    }
    if config.kodi.host.is_empty() {
        return Err(ConfigError::MissingField {
            field: "kodi.host".to_string(),
        });
    }
    Ok(())
}

/// First string argument of a node, e.g. the value in `host "127.0.0.1"`
fn first_string(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// First integer argument of a node, e.g. the value in `web-port 8080`
fn first_int(node: &kdl::KdlNode) -> Option<i64> {
    node.entries().first().and_then(|e| e.value().as_i64())
}

fn port_value(node: &kdl::KdlNode, field: &str) -> Result<Option<u16>, ConfigError> {
    match first_int(node) {
        Some(v) if (1..=i64::from(u16::MAX)).contains(&v) => Ok(Some(v as u16)),
        Some(v) => Err(ConfigError::Invalid {
            message: format!("{field}: {v} is not a valid port"),
        }),
        None => Ok(None),
    }
}

fn parse_controller(node: &kdl::KdlNode) -> Result<ControllerConfig, ConfigError> {
    let mut controller = ControllerConfig {
        mappings_dir: "/etc/kodi-forwarder/mappings".into(),
        ..ControllerConfig::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "identity" => {
                    if let Some(val) = first_string(child) {
                        controller.identity = val.to_lowercase();
                    }
                }
                "mapping" => {
                    if let Some(val) = first_string(child) {
                        controller.mapping = val;
                    }
                }
                "mappings-dir" => {
                    if let Some(val) = first_string(child) {
                        controller.mappings_dir = shellexpand::tilde(&val).into_owned().into();
                    }
                }
                name => {
                    tracing::warn!("Unknown controller config option: {}", name);
                }
            }
        }
    }

    Ok(controller)
}

fn parse_kodi(node: &kdl::KdlNode) -> Result<KodiConfig, ConfigError> {
    let mut kodi = KodiConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "host" => {
                    if let Some(val) = first_string(child) {
                        kodi.host = val;
                    }
                }
                "web-port" => {
                    if let Some(port) = port_value(child, "kodi.web-port")? {
                        kodi.web_port = port;
                    }
                }
                "eventserver-port" => {
                    if let Some(port) = port_value(child, "kodi.eventserver-port")? {
                        kodi.eventserver_port = port;
                    }
                }
                "user" => {
                    kodi.user = first_string(child);
                }
                "password" => {
                    kodi.password = first_string(child);
                }
                "mac" => {
                    kodi.mac = first_string(child).map(|m| m.to_lowercase());
                }
                "ssh" => {
                    kodi.ssh = parse_ssh(child)?;
                }
                name => {
                    tracing::warn!("Unknown kodi config option: {}", name);
                }
            }
        }
    }

    Ok(kodi)
}

fn parse_ssh(node: &kdl::KdlNode) -> Result<SshConfig, ConfigError> {
    let mut ssh = SshConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "port" => {
                    if let Some(port) = port_value(child, "kodi.ssh.port")? {
                        ssh.port = port;
                    }
                }
                "user" => {
                    ssh.user = first_string(child);
                }
                "password" => {
                    ssh.password = first_string(child);
                }
                "shutdown-command" => {
                    if let Some(val) = first_string(child) {
                        ssh.shutdown_command = val;
                    }
                }
                name => {
                    tracing::warn!("Unknown ssh config option: {}", name);
                }
            }
        }
    }

    Ok(ssh)
}

fn duration_value(
    node: &kdl::KdlNode,
    field: &str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>, ConfigError> {
    match first_int(node) {
        Some(v) if v >= 0 => Ok(Some(unit(v as u64))),
        Some(v) => Err(ConfigError::Invalid {
            message: format!("{field}: {v} must not be negative"),
        }),
        None => Ok(None),
    }
}

fn parse_timing(node: &kdl::KdlNode) -> Result<TimingConfig, ConfigError> {
    let mut timing = TimingConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "debounce-ms" => {
                    if let Some(d) = duration_value(child, "timing.debounce-ms", Duration::from_millis)? {
                        timing.debounce = d;
                    }
                }
                "liveness-secs" => {
                    if let Some(d) = duration_value(child, "timing.liveness-secs", Duration::from_secs)? {
                        timing.liveness_interval = d;
                    }
                }
                "keepalive-secs" => {
                    if let Some(d) = duration_value(child, "timing.keepalive-secs", Duration::from_secs)? {
                        timing.keepalive_interval = d;
                    }
                }
                "command-cooldown-secs" => {
                    if let Some(d) =
                        duration_value(child, "timing.command-cooldown-secs", Duration::from_secs)?
                    {
                        timing.command_cooldown = d;
                    }
                }
                "reacquire-ms" => {
                    if let Some(d) = duration_value(child, "timing.reacquire-ms", Duration::from_millis)? {
                        timing.reacquire_delay = d;
                    }
                }
                "io-timeout-secs" => {
                    if let Some(d) = duration_value(child, "timing.io-timeout-secs", Duration::from_secs)?
                    {
                        timing.io_timeout = d;
                    }
                }
                name => {
                    tracing::warn!("Unknown timing config option: {}", name);
                }
            }
        }
    }

    Ok(timing)
}
