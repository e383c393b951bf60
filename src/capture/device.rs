//! Device Identity and Grab State
//!
//! A captured device is identified by a stable identifier, not by its
//! `/dev/input/eventN` path: event numbers shuffle on reboot and hotplug.
//! The preferred identifier is the `/dev/input/by-id` symlink name; devices
//! without one fall back to `vendor:product:phys`. Configuration stores the
//! stable identifier and it is resolved back to the current path right
//! before opening.
//!
//! Grab state follows a small machine:
//!
//! ```text
//! Closed ──open──▶ Opened ──grab──▶ Grabbed ──ungrab──▶ Opened ──close──▶ Closed
//!                                     │
//!                                     └─loss─▶ Failed (reported, then Closed)
//! ```
//!
//! Grabbing requests exclusive kernel access (`EVIOCGRAB`): while a device
//! is grabbed the local session receives nothing from it. Grab and ungrab
//! are idempotent. A grab refused by the kernel (another process already
//! holds the device) is reported as [`CaptureError::BusyDevice`]; capture
//! never degrades silently to non-exclusive reads.

use evdev::{Device, Key, RelativeAxisType};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::CaptureError;

/// Keyboard role threshold: a device must expose at least this many keys in
/// the standard keyboard range to count as a keyboard.
const KEYBOARD_KEY_THRESHOLD: usize = 20;

/// Upper bound (inclusive) of the standard keyboard key range examined for
/// role detection. Button ranges (BTN_*) start above it.
const KEYBOARD_RANGE_END: u16 = 0x0ff;

/// What a device is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSet {
    /// Emits relative pointer motion (REL_X and REL_Y).
    pub pointer: bool,
    /// Emits enough standard keys to type on.
    pub keyboard: bool,
}

impl RoleSet {
    /// Neither role; such devices are ignored.
    pub fn is_empty(&self) -> bool {
        !self.pointer && !self.keyboard
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pointer, self.keyboard) {
            (true, true) => write!(f, "pointer+keyboard"),
            (true, false) => write!(f, "pointer"),
            (false, true) => write!(f, "keyboard"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// Stable identity of a kernel input device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// `/dev/input/by-id` symlink name, when the device has one.
    pub by_id: Option<String>,
    /// Vendor id from the input subsystem.
    pub vendor: u16,
    /// Product id from the input subsystem.
    pub product: u16,
    /// Physical bus path ("usb-0000:00:14.0-3/input0").
    pub phys: Option<String>,
    /// Human-readable device name.
    pub name: String,
}

impl DeviceIdentity {
    /// Read identity from an opened device, looking up the by-id symlink
    /// for its path.
    pub fn of(device: &Device, path: &Path) -> Self {
        let input_id = device.input_id();
        Self {
            by_id: by_id_link(path),
            vendor: input_id.vendor(),
            product: input_id.product(),
            phys: device.physical_path().map(str::to_string),
            name: device.name().unwrap_or("unnamed device").to_string(),
        }
    }

    /// The stable identifier stored in configuration.
    pub fn stable_id(&self) -> String {
        match &self.by_id {
            Some(link) => link.clone(),
            None => format!(
                "{:04x}:{:04x}:{}",
                self.vendor,
                self.product,
                self.phys.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// Resolve a stable identifier back to the device's current path.
///
/// Tried as a by-id symlink first, then matched against the identity of
/// every enumerable device. An identifier that matches nothing yields
/// [`CaptureError::DeviceGone`]; the caller drops that device and carries
/// on with the rest.
pub fn resolve_stable_id(stable_id: &str) -> Result<PathBuf, CaptureError> {
    let by_id = Path::new("/dev/input/by-id").join(stable_id);
    if by_id.exists() {
        match std::fs::canonicalize(&by_id) {
            Ok(path) => return Ok(path),
            Err(e) => {
                debug!(id = stable_id, error = %e, "by-id link did not resolve");
            }
        }
    }

    for (path, device) in evdev::enumerate() {
        if DeviceIdentity::of(&device, &path).stable_id() == stable_id {
            return Ok(path);
        }
    }

    Err(CaptureError::DeviceGone {
        id: stable_id.to_string(),
    })
}

/// Detect the roles a device can fill.
///
/// A pointer needs both relative axes; a keyboard needs a reasonable number
/// of keys in the standard range (enough to exclude headset buttons, power
/// keys and other one-button oddities).
pub fn detect_roles(device: &Device) -> RoleSet {
    let pointer = device
        .supported_relative_axes()
        .map(|axes| axes.contains(RelativeAxisType::REL_X) && axes.contains(RelativeAxisType::REL_Y))
        .unwrap_or(false);

    let keyboard = device
        .supported_keys()
        .map(|keys| {
            keys.iter()
                .filter(|key| {
                    key.code() >= Key::KEY_ESC.code() && key.code() <= KEYBOARD_RANGE_END
                })
                .count()
                >= KEYBOARD_KEY_THRESHOLD
        })
        .unwrap_or(false);

    RoleSet { pointer, keyboard }
}

/// Grab lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabState {
    /// Device open, events visible to the local session.
    Opened,
    /// Exclusive kernel grab held; local session sees nothing.
    Grabbed,
}

/// Tracks and applies the grab state for one opened device.
///
/// The tracker is owned by the device's read task (the only place the
/// kernel handle lives) and driven by routing changes. Both transitions are
/// idempotent.
#[derive(Debug)]
pub struct GrabTracker {
    state: GrabState,
    stable_id: String,
}

impl GrabTracker {
    /// New tracker for a freshly opened (ungrabbed) device.
    pub fn new(stable_id: String) -> Self {
        Self {
            state: GrabState::Opened,
            stable_id,
        }
    }

    /// Current state.
    pub fn state(&self) -> GrabState {
        self.state
    }

    /// Acquire the exclusive grab. No-op when already grabbed.
    pub fn grab(&mut self, device: &mut Device) -> Result<(), CaptureError> {
        if self.state == GrabState::Grabbed {
            return Ok(());
        }
        device.grab().map_err(|source| {
            if source.raw_os_error() == Some(libc::EBUSY) {
                CaptureError::BusyDevice {
                    id: self.stable_id.clone(),
                }
            } else {
                CaptureError::Io {
                    id: self.stable_id.clone(),
                    source,
                }
            }
        })?;
        self.state = GrabState::Grabbed;
        debug!(id = %self.stable_id, "device grabbed");
        Ok(())
    }

    /// Release the exclusive grab. No-op when not grabbed.
    pub fn ungrab(&mut self, device: &mut Device) -> Result<(), CaptureError> {
        if self.state == GrabState::Opened {
            return Ok(());
        }
        match device.ungrab() {
            Ok(()) => {
                self.state = GrabState::Opened;
                debug!(id = %self.stable_id, "device ungrabbed");
                Ok(())
            }
            Err(source) => {
                // The kernel drops a grab with the fd, so even on failure
                // the local session will get the device back eventually.
                warn!(id = %self.stable_id, error = %source, "ungrab failed");
                self.state = GrabState::Opened;
                Err(CaptureError::Io {
                    id: self.stable_id.clone(),
                    source,
                })
            }
        }
    }
}

fn by_id_link(device_path: &Path) -> Option<String> {
    let dir = std::fs::read_dir("/dev/input/by-id").ok()?;
    for entry in dir.flatten() {
        if let Ok(target) = std::fs::canonicalize(entry.path()) {
            if target == device_path {
                return Some(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    None
}
