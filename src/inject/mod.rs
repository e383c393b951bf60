//! Virtual Input Injection
//!
//! Client-side replay of the relayed event stream. The injector connects
//! to the user's Wayland session, binds the virtual-input globals and
//! recreates each received event on a virtual pointer and a virtual
//! keyboard:
//!
//! - `zwp_virtual_keyboard_manager_v1` (virtual-keyboard-unstable-v1)
//! - `zwlr_virtual_pointer_manager_v1` (wlr-virtual-pointer-unstable-v1)
//!
//! A compositor that does not advertise both managers cannot host a
//! client; binding fails with [`InjectError::CompositorUnsupported`]
//! naming the missing global.
//!
//! # Release Safety
//!
//! The injector tracks every key and button it has pressed. All teardown
//! paths — orderly disconnect, control release, drop — emit matching
//! release events before the virtual devices are destroyed, so the client
//! session is never left with a stuck key. [`Injector::release_pressed`]
//! is also invoked on an explicit control release from the server.

mod keyboard;
mod pointer;
mod replay;

pub use keyboard::{default_keymap, KeymapError, VirtualKeyboard};
pub use pointer::VirtualPointer;
pub use replay::{ModifierMasks, ModifierTracker, PressedState};

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use wayland_client::globals::{registry_queue_init, BindError, GlobalError};
use wayland_client::protocol::{wl_registry, wl_seat::WlSeat};
use wayland_client::{Connection, Dispatch, EventQueue, QueueHandle};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use crate::protocol::{capabilities, Event};

/// Injection failures.
#[derive(Debug, Error)]
pub enum InjectError {
    /// The compositor does not implement a required virtual-input global.
    #[error("compositor unsupported: {missing} is not advertised")]
    CompositorUnsupported {
        /// Interface name of the missing global.
        missing: &'static str,
    },

    /// No Wayland session to connect to.
    #[error("cannot connect to Wayland display: {0}")]
    Connect(#[from] wayland_client::ConnectError),

    /// Registry enumeration failed.
    #[error("Wayland registry error: {0}")]
    Registry(#[from] GlobalError),

    /// The default keymap could not be prepared.
    #[error(transparent)]
    Keymap(#[from] KeymapError),

    /// Protocol dispatch failed.
    #[error("Wayland dispatch error: {0}")]
    Dispatch(#[from] wayland_client::DispatchError),

    /// Flushing requests to the compositor failed.
    #[error("Wayland connection error: {0}")]
    Backend(#[from] wayland_client::backend::WaylandError),
}

/// Event-queue state for the injector's protocol objects. None of them
/// deliver events we act on.
pub struct InjectorState;

/// Virtual pointer + keyboard bound to the client's Wayland session.
pub struct Injector {
    connection: Connection,
    queue: Mutex<EventQueue<InjectorState>>,
    keyboard: VirtualKeyboard,
    pointer: VirtualPointer,
    pressed: PressedState,
    modifiers: ModifierTracker,
}

impl Injector {
    /// Connect to the session compositor and create the virtual devices.
    ///
    /// Binding order: registry, virtual keyboard manager, virtual pointer
    /// manager, seat, then device creation and the keymap upload, closed
    /// by a roundtrip so protocol errors surface here and not on the first
    /// injected event.
    pub fn bind() -> Result<Self, InjectError> {
        let connection = Connection::connect_to_env()?;
        info!("connected to Wayland display");

        let (globals, mut queue) = registry_queue_init::<InjectorState>(&connection)?;
        let qh = queue.handle();

        let keyboard_manager: ZwpVirtualKeyboardManagerV1 =
            bind_global(&globals, &qh, 1..=1, "zwp_virtual_keyboard_manager_v1")?;
        let pointer_manager: ZwlrVirtualPointerManagerV1 =
            bind_global(&globals, &qh, 1..=2, "zwlr_virtual_pointer_manager_v1")?;
        let seat: WlSeat = bind_global(&globals, &qh, 1..=8, "wl_seat")?;

        let keyboard = VirtualKeyboard::new(&keyboard_manager, &seat, &qh)?;
        let pointer = VirtualPointer::new(&pointer_manager, &seat, &qh);

        queue.roundtrip(&mut InjectorState)?;
        info!("virtual keyboard and pointer ready");

        Ok(Self {
            connection,
            queue: Mutex::new(queue),
            keyboard,
            pointer,
            pressed: PressedState::new(),
            modifiers: ModifierTracker::new(),
        })
    }

    /// Capability bits this injector provides, advertised to the server.
    pub fn capability_bits() -> u32 {
        capabilities::POINTER | capabilities::KEYBOARD | capabilities::SCROLL
    }

    /// Replay one input event on the virtual devices. Control events are
    /// not input and are ignored here.
    pub fn inject(&mut self, event: &Event) -> Result<(), InjectError> {
        let time = now_millis();
        match event {
            Event::MouseMove { dx, dy, .. } => {
                self.pointer.motion(time, f64::from(*dx), f64::from(*dy));
            }
            Event::MouseButton {
                button, pressed, ..
            } => {
                self.pressed.note_button(*button, *pressed);
                self.pointer.button(time, u32::from(*button), *pressed);
            }
            Event::MouseScroll {
                axis, value, steps, ..
            } => {
                self.pointer.scroll(time, *axis, *value, *steps);
            }
            Event::Key { code, pressed, .. } => {
                self.pressed.note_key(*code, *pressed);
                self.keyboard.key(time, u32::from(*code), *pressed);
                if let Some(masks) = self.modifiers.feed(*code, *pressed) {
                    self.keyboard
                        .modifiers(masks.depressed, masks.latched, masks.locked, masks.group);
                }
            }
            Event::Control(_) => {}
        }
        self.flush()
    }

    /// Emit release events for everything currently held down.
    ///
    /// Called on control release, on disconnect, and from the drop guard.
    pub fn release_pressed(&mut self) -> Result<(), InjectError> {
        if self.pressed.is_clear() {
            return Ok(());
        }
        let time = now_millis();
        let (keys, buttons) = self.pressed.drain();
        debug!(
            keys = keys.len(),
            buttons = buttons.len(),
            "releasing held keys and buttons"
        );
        for code in keys {
            self.keyboard.key(time, u32::from(code), false);
            if let Some(masks) = self.modifiers.feed(code, false) {
                self.keyboard
                    .modifiers(masks.depressed, masks.latched, masks.locked, masks.group);
            }
        }
        for button in buttons {
            self.pointer.button(time, u32::from(button), false);
        }
        self.flush()
    }

    /// Release held input and destroy the virtual devices.
    pub fn close(mut self) {
        if let Err(e) = self.release_pressed() {
            warn!(error = %e, "release on close failed");
        }
        // Devices are destroyed by the field drops.
    }

    fn flush(&self) -> Result<(), InjectError> {
        {
            let mut queue = self.queue.lock().expect("injector queue poisoned");
            // Non-blocking: only drains events already delivered.
            queue.dispatch_pending(&mut InjectorState)?;
        }
        self.connection.flush()?;
        Ok(())
    }
}

impl Drop for Injector {
    fn drop(&mut self) {
        // Last line of defense against stuck keys; the orderly paths have
        // already drained the pressed set by now.
        if !self.pressed.is_clear() {
            if let Err(e) = self.release_pressed() {
                warn!(error = %e, "release on drop failed");
            }
        }
    }
}

fn bind_global<T>(
    globals: &wayland_client::globals::GlobalList,
    qh: &QueueHandle<InjectorState>,
    versions: std::ops::RangeInclusive<u32>,
    name: &'static str,
) -> Result<T, InjectError>
where
    T: wayland_client::Proxy + 'static,
    InjectorState: Dispatch<T, ()>,
{
    globals.bind(qh, versions, ()).map_err(|e| match e {
        BindError::NotPresent => InjectError::CompositorUnsupported { missing: name },
        BindError::UnsupportedVersion => InjectError::CompositorUnsupported { missing: name },
    })
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Dispatch plumbing: none of these objects send events we consume.
// ---------------------------------------------------------------------------

impl Dispatch<wl_registry::WlRegistry, wayland_client::globals::GlobalListContents>
    for InjectorState
{
    fn event(
        _state: &mut Self,
        _proxy: &wl_registry::WlRegistry,
        _event: wl_registry::Event,
        _data: &wayland_client::globals::GlobalListContents,
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwpVirtualKeyboardManagerV1, ()> for InjectorState {
    fn event(
        _state: &mut Self,
        _proxy: &ZwpVirtualKeyboardManagerV1,
        _event: <ZwpVirtualKeyboardManagerV1 as wayland_client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwlrVirtualPointerManagerV1, ()> for InjectorState {
    fn event(
        _state: &mut Self,
        _proxy: &ZwlrVirtualPointerManagerV1,
        _event: <ZwlrVirtualPointerManagerV1 as wayland_client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<WlSeat, ()> for InjectorState {
    fn event(
        _state: &mut Self,
        _proxy: &WlSeat,
        _event: <WlSeat as wayland_client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwpVirtualKeyboardV1, ()> for InjectorState {
    fn event(
        _state: &mut Self,
        _proxy: &ZwpVirtualKeyboardV1,
        _event: <ZwpVirtualKeyboardV1 as wayland_client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwlrVirtualPointerV1, ()> for InjectorState {
    fn event(
        _state: &mut Self,
        _proxy: &ZwlrVirtualPointerV1,
        _event: <ZwlrVirtualPointerV1 as wayland_client::Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _qhandle: &QueueHandle<Self>,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_bits_cover_all_event_kinds() {
        let bits = Injector::capability_bits();
        assert_ne!(bits & capabilities::POINTER, 0);
        assert_ne!(bits & capabilities::KEYBOARD, 0);
        assert_ne!(bits & capabilities::SCROLL, 0);
    }

    #[test]
    #[ignore] // Requires a running Wayland compositor with virtual-input support
    fn bind_against_live_compositor() {
        match Injector::bind() {
            Ok(_injector) => {}
            Err(InjectError::CompositorUnsupported { missing }) => {
                println!("compositor lacks {missing}");
            }
            Err(e) => panic!("unexpected bind failure: {e}"),
        }
    }
}
