//! Device Capture
//!
//! Produces the canonical event stream from the machine's real keyboards
//! and mice. The module owns everything between `/dev/input` and the
//! routing layer:
//!
//! - enumeration and role detection (a pointer needs both relative axes, a
//!   keyboard needs a real key range, everything else is ignored);
//! - stable identification so configuration survives reboots and replugs;
//! - exclusive kernel grabs, engaged only while input is routed to a
//!   remote client and released on every exit path;
//! - translation of raw kernel events into canonical events, coalesced at
//!   synchronization boundaries.
//!
//! # Task Model
//!
//! One tokio task per opened device performs the blocking-style event
//! reads. Grab transitions are signalled to the tasks over a watch
//! channel, so the kernel handle never leaves its owning task. All tasks
//! feed a single bounded queue with drop-oldest overflow.
//!
//! Failures stay scoped to the failing device: a device that disappears or
//! starts erroring is dropped (after releasing its grab) while the others
//! keep running.

mod device;
mod stream;

pub use device::{detect_roles, resolve_stable_id, DeviceIdentity, GrabState, RoleSet};
pub use stream::EventQueue;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CaptureConfig;

/// Capture failures. All variants except [`CaptureError::Privilege`] and
/// [`CaptureError::NoDevices`] are scoped to a single device.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A configured stable identifier no longer resolves to a device node.
    #[error("device gone: stable id {id:?} does not resolve")]
    DeviceGone {
        /// The stable identifier that failed to resolve.
        id: String,
    },

    /// The kernel refused the exclusive grab; some other process holds it.
    #[error("device busy: {id:?} is exclusively grabbed by another process")]
    BusyDevice {
        /// Stable identifier of the busy device.
        id: String,
    },

    /// Opening a device node was denied. Usually means the process is not
    /// in the `input` group and is not root.
    #[error("insufficient privileges to open {path}: {source}")]
    Privilege {
        /// The device node that could not be opened.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Any other I/O failure on a specific device.
    #[error("device {id:?} I/O failure: {source}")]
    Io {
        /// Stable identifier of the failing device.
        id: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Enumeration found nothing with a pointer or keyboard role.
    #[error("no usable input devices found")]
    NoDevices,
}

/// Descriptive snapshot of one managed device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Stable identifier.
    pub stable_id: String,
    /// Human-readable name.
    pub name: String,
    /// Detected roles.
    pub roles: RoleSet,
}

struct DeviceEntry {
    info: DeviceInfo,
    task: JoinHandle<()>,
}

/// Owns every opened device and its read task.
///
/// Created with devices opened but ungrabbed. Devices follow the routing
/// layer's grab wish (the watch channel handed to [`CaptureManager::
/// start`]): true grabs every device, false releases every device, both
/// idempotent. Stopping the manager cancels the tasks, each of which
/// releases its own grab on the way out.
pub struct CaptureManager {
    devices: Vec<DeviceEntry>,
    queue: Arc<EventQueue>,
    cancel: CancellationToken,
}

impl CaptureManager {
    /// Enumerate, open, and start reading devices. Devices are left in the
    /// ungrabbed state.
    ///
    /// Per-device failures (gone, permission) are logged and skipped; the
    /// call fails only when nothing at all could be opened —
    /// [`CaptureError::Privilege`] if permissions were the reason,
    /// [`CaptureError::NoDevices`] otherwise.
    pub fn start(
        config: &CaptureConfig,
        grab_wish: watch::Receiver<bool>,
        shutdown: &CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CaptureError>), CaptureError> {
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let cancel = shutdown.child_token();

        let candidates = if config.devices.is_empty() {
            autodetect()
        } else {
            resolve_configured(&config.devices)
        };

        let mut devices = Vec::new();
        let mut permission_failure = None;

        for (path, device, roles) in candidates {
            let identity = DeviceIdentity::of(&device, &path);
            let stable_id = identity.stable_id();
            info!(
                id = %stable_id,
                name = %identity.name,
                roles = %roles,
                "capturing device"
            );

            let task = tokio::spawn(stream::run_device(
                device,
                stable_id.clone(),
                grab_wish.clone(),
                queue.clone(),
                error_tx.clone(),
                cancel.clone(),
            ));
            devices.push(DeviceEntry {
                info: DeviceInfo {
                    stable_id,
                    name: identity.name,
                    roles,
                },
                task,
            });
        }

        // Re-walk the nodes we could not open to classify total failure.
        if devices.is_empty() {
            if let Some(source) = open_errors_were_permission() {
                permission_failure = Some(source);
            }
            return Err(match permission_failure {
                Some((path, source)) => CaptureError::Privilege { path, source },
                None => CaptureError::NoDevices,
            });
        }

        Ok((
            Self {
                devices,
                queue,
                cancel,
            },
            error_rx,
        ))
    }

    /// Shared handle to the captured-event queue.
    pub fn queue(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    /// Snapshot of managed devices.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|e| e.info.clone()).collect()
    }

    /// Stop all read tasks; each releases its grab on the way out.
    pub async fn stop(self) {
        self.cancel.cancel();
        for entry in self.devices {
            if let Err(e) = entry.task.await {
                if !e.is_cancelled() {
                    warn!(id = %entry.info.stable_id, error = %e, "device task join failed");
                }
            }
        }
        info!("device capture stopped");
    }
}

/// Scan for devices with a pointer or keyboard role.
fn autodetect() -> Vec<(PathBuf, evdev::Device, RoleSet)> {
    let mut found = Vec::new();
    for (path, device) in evdev::enumerate() {
        let roles = detect_roles(&device);
        if roles.is_empty() {
            continue;
        }
        found.push((path, device, roles));
    }
    // Enumeration order is directory order; keep it deterministic.
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

/// Open explicitly configured devices, resolving stable identifiers first.
/// Roles are still detected (the grab machinery needs to know), but an
/// explicit device is captured even if autodetection would have skipped it.
fn resolve_configured(stable_ids: &[String]) -> Vec<(PathBuf, evdev::Device, RoleSet)> {
    let mut found = Vec::new();
    for id in stable_ids {
        let path = match resolve_stable_id(id) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "skipping configured device");
                continue;
            }
        };
        match evdev::Device::open(&path) {
            Ok(device) => {
                let roles = detect_roles(&device);
                found.push((path, device, roles));
            }
            Err(source) => {
                warn!(id = %id, path = %path.display(), error = %source, "cannot open configured device");
            }
        }
    }
    found
}

/// Probe whether the empty enumeration was a permissions problem: try the
/// first few event nodes directly and report the first EACCES.
fn open_errors_were_permission() -> Option<(PathBuf, std::io::Error)> {
    let dir = std::fs::read_dir("/dev/input").ok()?;
    for entry in dir.flatten() {
        let path = entry.path();
        let is_event_node = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("event"));
        if !is_event_node {
            continue;
        }
        match evdev::Device::open(&path) {
            Err(source) if source.kind() == std::io::ErrorKind::PermissionDenied => {
                return Some((path, source));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_messages_name_the_device() {
        let gone = CaptureError::DeviceGone {
            id: "usb-Keychron_K2-event-kbd".into(),
        };
        assert!(gone.to_string().contains("Keychron"));

        let busy = CaptureError::BusyDevice {
            id: "usb-Logitech_G502-event-mouse".into(),
        };
        assert!(busy.to_string().contains("grabbed by another process"));
    }

    #[tokio::test]
    async fn start_without_devices_reports_no_devices() {
        // In a sandboxed test environment /dev/input is typically absent or
        // empty, which must map to a clean NoDevices / Privilege error
        // rather than a panic.
        let config = CaptureConfig {
            devices: vec![],
            queue_capacity: 16,
        };
        let shutdown = CancellationToken::new();
        let (_grab_tx, grab_rx) = watch::channel(false);
        match CaptureManager::start(&config, grab_rx, &shutdown) {
            Ok((manager, _errors)) => {
                // Machine actually has readable devices; clean up.
                manager.stop().await;
            }
            Err(CaptureError::NoDevices) | Err(CaptureError::Privilege { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn configured_unknown_device_is_skipped_not_fatal() {
        let config = CaptureConfig {
            devices: vec!["usb-Vendor_Unknown-event-kbd".into()],
            queue_capacity: 16,
        };
        let shutdown = CancellationToken::new();
        let (_grab_tx, grab_rx) = watch::channel(false);
        match CaptureManager::start(&config, grab_rx, &shutdown) {
            Err(CaptureError::NoDevices) | Err(CaptureError::Privilege { .. }) => {}
            Ok((manager, _errors)) => manager.stop().await,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
