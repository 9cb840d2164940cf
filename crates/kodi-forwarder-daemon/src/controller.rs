//! Input controller acquisition and events
//!
//! The paired remote shows up as an evdev device whose `phys` attribute
//! carries the controller's link-layer address. Acquisition scans
//! `/dev/input` for it; the device is read, never grabbed, since nothing
//! else on a media box competes for a remote.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use evdev::Device;
use kodi_forwarder_config::EventPhase;

/// One key event off the controller, reduced to what the resolver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKeyEvent {
    /// Kernel key name, e.g. `KEY_PLAYPAUSE`
    pub key: String,
    pub phase: EventPhase,
}

/// An acquired controller delivering key events.
pub struct Controller {
    name: String,
    stream: evdev::EventStream,
}

impl Controller {
    /// Scan `/dev/input` for the device whose physical address matches
    /// `identity`. Returns `Ok(None)` when the controller is simply not
    /// there (asleep, out of range); that is the common case, not an error.
    pub fn open_by_identity(identity: &str) -> Result<Option<Controller>> {
        for entry in std::fs::read_dir("/dev/input").context("reading /dev/input")? {
            let path = entry?.path();

            // Only look at event* devices
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("event"))
                .unwrap_or(false)
            {
                continue;
            }

            let device = match Device::open(&path) {
                Ok(device) => device,
                Err(e) => {
                    tracing::debug!("Could not open {}: {}", path.display(), e);
                    continue;
                }
            };

            let matches = device
                .physical_path()
                .map(|phys| phys.eq_ignore_ascii_case(identity))
                .unwrap_or(false);
            if !matches {
                continue;
            }

            let name = device.name().unwrap_or("Unknown").to_string();
            let stream = device.into_event_stream().with_context(|| {
                format!("creating event stream for {}", path.display())
            })?;

            tracing::info!("Controller '{}' acquired at {}", name, path.display());
            return Ok(Some(Controller { name, stream }));
        }

        Ok(None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next key event from the controller. Blocks until one arrives,
    /// skipping synchronization and non-key events; an IO error means the
    /// device is gone and the handle should be dropped.
    pub async fn next_key_event(&mut self) -> std::io::Result<RawKeyEvent> {
        loop {
            let event = self.stream.next_event().await?;
            if event.event_type() != evdev::EventType::KEY {
                continue;
            }

            let Some(phase) = EventPhase::from_event_value(event.value()) else {
                continue;
            };

            let key = format!("{:?}", evdev::Key::new(event.code()));
            if !key.starts_with("KEY_") && !key.starts_with("BTN_") {
                tracing::trace!("Ignoring unnamed key code {}", event.code());
                continue;
            }

            return Ok(RawKeyEvent { key, phase });
        }
    }
}

/// Information about one input device, for the `--list-devices` helper.
#[derive(Debug)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub phys: Option<String>,
}

/// Enumerate all input devices
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev/input")? {
        let path = entry?.path();

        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false)
        {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                devices.push(DeviceInfo {
                    name: device.name().unwrap_or("Unknown").to_string(),
                    phys: device.physical_path().map(str::to_string),
                    path,
                });
            }
            Err(e) => {
                tracing::debug!("Could not open {}: {}", path.display(), e);
            }
        }
    }

    Ok(devices)
}

/// Control over the radio link to the paired controller.
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Drop the pairing link. Called after the host goes away so a powered
    /// off host does not leave the remote attached to a stale link.
    async fn force_disconnect(&self);
}

pub struct BluetoothLink {
    identity: String,
}

impl BluetoothLink {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
        }
    }
}

#[async_trait]
impl LinkControl for BluetoothLink {
    async fn force_disconnect(&self) {
        let result = tokio::process::Command::new("bluetoothctl")
            .arg("disconnect")
            .arg(&self.identity)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                tracing::info!("Dropped bluetooth link to {}", self.identity);
            }
            Ok(output) => {
                tracing::debug!(
                    "bluetoothctl disconnect {} exited with {}",
                    self.identity,
                    output.status
                );
            }
            Err(e) => {
                tracing::debug!("Could not run bluetoothctl: {}", e);
            }
        }
    }
}
