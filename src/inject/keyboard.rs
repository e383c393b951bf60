//! Virtual Keyboard
//!
//! Wrapper around `zwp_virtual_keyboard_v1`. The protocol requires an XKB
//! keymap before any key event is accepted; a default US keymap is
//! compiled with libxkbcommon, written to a memfd and handed to the
//! compositor. The fd stays open for the lifetime of the keyboard — the
//! compositor reads it lazily and owns nothing but the offset.
//!
//! Key events carry Linux evdev keycodes, exactly as captured on the
//! server; the compositor applies the +8 offset when it resolves them
//! against the keymap. No layout mirroring happens here: a key position on
//! the server resolves through the default keymap on the client, so
//! layout-dependent characters may differ between sites.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use thiserror::Error;
use tracing::debug;
use wayland_client::protocol::wl_seat::WlSeat;
use wayland_client::{Dispatch, QueueHandle};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use xkbcommon::xkb;

/// XKB v1 keymap format tag from the wl_keyboard enum.
const KEYMAP_FORMAT_XKB_V1: u32 = 1;

/// Keymap construction failures.
#[derive(Debug, Error)]
pub enum KeymapError {
    /// libxkbcommon could not compile the default keymap.
    #[error("failed to compile default XKB keymap")]
    Compile,

    /// The memfd carrying the keymap could not be created or written.
    #[error("failed to share keymap with compositor: {0}")]
    Share(#[source] std::io::Error),
}

/// Virtual keyboard bound to a seat, keymap already uploaded.
pub struct VirtualKeyboard {
    keyboard: ZwpVirtualKeyboardV1,
    // Compositor may read the keymap at any time; keep the fd alive.
    _keymap_fd: OwnedFd,
}

impl VirtualKeyboard {
    /// Create the virtual keyboard and upload the default keymap.
    pub fn new<State>(
        manager: &ZwpVirtualKeyboardManagerV1,
        seat: &WlSeat,
        qh: &QueueHandle<State>,
    ) -> Result<Self, KeymapError>
    where
        State: Dispatch<ZwpVirtualKeyboardV1, ()> + 'static,
    {
        let keymap_string = default_keymap()?;
        let keymap_fd = keymap_memfd(&keymap_string)?;

        let keyboard = manager.create_virtual_keyboard(seat, qh, ());
        keyboard.keymap(
            KEYMAP_FORMAT_XKB_V1,
            keymap_fd.as_fd(),
            keymap_string.len() as u32,
        );

        debug!(bytes = keymap_string.len(), "virtual keyboard created, keymap uploaded");

        Ok(Self {
            keyboard,
            _keymap_fd: keymap_fd,
        })
    }

    /// Inject a key press or release. `code` is a Linux evdev keycode.
    pub fn key(&self, time: u32, code: u32, pressed: bool) {
        self.keyboard.key(time, code, u32::from(pressed));
    }

    /// Update modifier masks (depressed, latched, locked, layout group).
    pub fn modifiers(&self, depressed: u32, latched: u32, locked: u32, group: u32) {
        self.keyboard.modifiers(depressed, latched, locked, group);
    }
}

impl Drop for VirtualKeyboard {
    fn drop(&mut self) {
        debug!("virtual keyboard destroyed");
        self.keyboard.destroy();
    }
}

/// Compile the default keymap: evdev rules, US layout, no options.
///
/// This is deliberately not the server's layout — see the module docs.
pub fn default_keymap() -> Result<String, KeymapError> {
    let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
    let keymap = xkb::Keymap::new_from_names(
        &context,
        "evdev",
        "pc105",
        "us",
        "",
        None,
        xkb::KEYMAP_COMPILE_NO_FLAGS,
    )
    .ok_or(KeymapError::Compile)?;

    let keymap_string = keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);
    if keymap_string.is_empty() {
        return Err(KeymapError::Compile);
    }
    Ok(keymap_string)
}

/// Write the keymap into an anonymous memfd, rewound to the start.
fn keymap_memfd(keymap: &str) -> Result<OwnedFd, KeymapError> {
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use nix::unistd::{lseek, write, Whence};
    use std::ffi::CString;

    let name = CString::new("waylink-keymap").expect("static name");
    let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)
        .map_err(|e| KeymapError::Share(std::io::Error::from(e)))?;

    let bytes = keymap.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        match write(fd.as_fd(), &bytes[written..]) {
            Ok(0) => {
                return Err(KeymapError::Share(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "zero-length write to keymap memfd",
                )))
            }
            Ok(n) => written += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(KeymapError::Share(std::io::Error::from(e))),
        }
    }

    lseek(fd.as_raw_fd(), 0, Whence::SeekSet)
        .map_err(|e| KeymapError::Share(std::io::Error::from(e)))?;

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_keymap_compiles() {
        match default_keymap() {
            Ok(keymap) => {
                assert!(keymap.contains("xkb_keymap"));
                assert!(keymap.contains("xkb_symbols"));
            }
            Err(e) => {
                // Minimal containers may lack the xkb data files.
                println!("keymap compilation unavailable here: {e}");
            }
        }
    }

    #[test]
    fn keymap_memfd_round_trips() {
        let content = "xkb_keymap { };";
        let fd = match keymap_memfd(content) {
            Ok(fd) => fd,
            Err(e) => {
                println!("memfd unavailable here: {e}");
                return;
            }
        };

        use nix::unistd::{lseek, read, Whence};
        lseek(fd.as_raw_fd(), 0, Whence::SeekSet).unwrap();
        let mut buffer = vec![0u8; content.len()];
        let n = read(fd.as_raw_fd(), &mut buffer).unwrap();
        assert_eq!(&buffer[..n], content.as_bytes());
    }
}
