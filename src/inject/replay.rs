//! Replay State
//!
//! Bookkeeping that makes injection safe to tear down: every key and
//! button observed as pressed is tracked so that any disconnect path can
//! emit the matching releases before the virtual devices are destroyed.
//! Without this, a client that vanishes mid-keystroke leaves the remote
//! session with a stuck modifier.
//!
//! Modifier state is tracked through libxkbcommon against the same default
//! keymap the virtual keyboard uploaded, and serialized masks are sent to
//! the compositor whenever a key event changes them.

use std::collections::BTreeSet;
use xkbcommon::xkb;

use super::keyboard::default_keymap;

/// Offset between evdev keycodes and XKB keycodes.
const XKB_KEYCODE_OFFSET: u32 = 8;

/// Set of keys and buttons currently held down by injected events.
#[derive(Debug, Default)]
pub struct PressedState {
    keys: BTreeSet<u16>,
    buttons: BTreeSet<u16>,
}

impl PressedState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a key transition.
    pub fn note_key(&mut self, code: u16, pressed: bool) {
        if pressed {
            self.keys.insert(code);
        } else {
            self.keys.remove(&code);
        }
    }

    /// Record a button transition.
    pub fn note_button(&mut self, button: u16, pressed: bool) {
        if pressed {
            self.buttons.insert(button);
        } else {
            self.buttons.remove(&button);
        }
    }

    /// Whether anything is held down.
    pub fn is_clear(&self) -> bool {
        self.keys.is_empty() && self.buttons.is_empty()
    }

    /// Take everything currently held, leaving the state clear. Returned
    /// in deterministic (ascending code) order.
    pub fn drain(&mut self) -> (Vec<u16>, Vec<u16>) {
        let keys = std::mem::take(&mut self.keys).into_iter().collect();
        let buttons = std::mem::take(&mut self.buttons).into_iter().collect();
        (keys, buttons)
    }
}

/// Serialized modifier masks for the virtual keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierMasks {
    /// Currently held modifiers.
    pub depressed: u32,
    /// Latched (sticky) modifiers.
    pub latched: u32,
    /// Locked modifiers (caps lock, num lock).
    pub locked: u32,
    /// Effective layout group.
    pub group: u32,
}

/// Feeds key events through an XKB state machine and reports modifier
/// changes.
///
/// Falls back to a no-op when the keymap cannot be compiled (headless test
/// environments); plain keys still work there, modifier-dependent
/// characters do not.
pub struct ModifierTracker {
    state: Option<xkb::State>,
}

impl ModifierTracker {
    /// Tracker over the default keymap.
    pub fn new() -> Self {
        let state = default_keymap()
            .ok()
            .and_then(|text| {
                let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
                xkb::Keymap::new_from_string(
                    &context,
                    text,
                    xkb::KEYMAP_FORMAT_TEXT_V1,
                    xkb::KEYMAP_COMPILE_NO_FLAGS,
                )
            })
            .map(|keymap| xkb::State::new(&keymap));
        Self { state }
    }

    /// Feed one key transition; returns new masks when they changed.
    pub fn feed(&mut self, code: u16, pressed: bool) -> Option<ModifierMasks> {
        let state = self.state.as_mut()?;
        let direction = if pressed {
            xkb::KeyDirection::Down
        } else {
            xkb::KeyDirection::Up
        };
        let changed = state.update_key((u32::from(code) + XKB_KEYCODE_OFFSET).into(), direction);
        if changed == 0 {
            return None;
        }
        Some(ModifierMasks {
            depressed: state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: state.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        })
    }
}

impl Default for ModifierTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressed_state_tracks_and_drains() {
        let mut state = PressedState::new();
        state.note_key(30, true);
        state.note_key(42, true);
        state.note_button(272, true);
        state.note_key(30, false);
        assert!(!state.is_clear());

        let (keys, buttons) = state.drain();
        assert_eq!(keys, vec![42]);
        assert_eq!(buttons, vec![272]);
        assert!(state.is_clear());
    }

    #[test]
    fn drain_is_deterministic() {
        let mut state = PressedState::new();
        for code in [105, 29, 56] {
            state.note_key(code, true);
        }
        let (keys, _) = state.drain();
        assert_eq!(keys, vec![29, 56, 105]);
    }

    #[test]
    fn shift_changes_modifier_masks() {
        let mut tracker = ModifierTracker::new();
        if tracker.state.is_none() {
            println!("xkb unavailable here, skipping");
            return;
        }
        // KEY_LEFTSHIFT = 42
        let masks = tracker.feed(42, true).expect("shift press changes mods");
        assert_ne!(masks.depressed, 0);
        let masks = tracker.feed(42, false).expect("shift release changes mods");
        assert_eq!(masks.depressed, 0);
    }

    #[test]
    fn plain_key_does_not_change_masks() {
        let mut tracker = ModifierTracker::new();
        if tracker.state.is_none() {
            return;
        }
        // KEY_A = 30: no modifier component changes.
        assert!(tracker.feed(30, true).is_none());
        assert!(tracker.feed(30, false).is_none());
    }
}
