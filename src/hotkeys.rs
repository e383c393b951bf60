//! Hotkey Chords
//!
//! Switching is operator-driven, and the operator's hands are on the very
//! keyboard being relayed — so switch commands ride on the captured key
//! stream itself. The detector watches for Ctrl+Alt chords:
//!
//! | chord              | action                     |
//! |--------------------|----------------------------|
//! | Ctrl+Alt+1 .. 5    | connect to slot 1 .. 5     |
//! | Ctrl+Alt+0, +Esc   | release to local           |
//! | Ctrl+Alt+Right     | next client                |
//! | Ctrl+Alt+Left      | previous client            |
//!
//! A key press that completes a chord is swallowed (and so is its eventual
//! release) instead of being forwarded — the client being controlled must
//! not see the digit that switched away from it. The modifiers themselves
//! are forwarded normally; their presses predate the chord and the paired
//! releases keep remote modifier state consistent.

use std::collections::HashSet;

use crate::protocol::Event;

// evdev key codes involved in chords.
const KEY_ESC: u16 = 1;
const KEY_1: u16 = 2;
const KEY_5: u16 = 6;
const KEY_0: u16 = 11;
const KEY_LEFTCTRL: u16 = 29;
const KEY_LEFTALT: u16 = 56;
const KEY_RIGHTCTRL: u16 = 97;
const KEY_RIGHTALT: u16 = 100;
const KEY_LEFT: u16 = 105;
const KEY_RIGHT: u16 = 106;

/// Operator command decoded from a chord.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyAction {
    /// Route input to the 1-based slot.
    ConnectSlot(u8),
    /// Route input back to local.
    Release,
    /// Rotate forward through the registered clients.
    Next,
    /// Rotate backward.
    Prev,
}

/// What to do with one captured event.
#[derive(Debug, PartialEq, Eq)]
pub enum ChordOutcome {
    /// Forward the event normally.
    Pass,
    /// Drop the event; it belonged to a chord.
    Swallow,
    /// Drop the event and perform the action.
    Action(HotkeyAction),
}

/// Tracks modifier state and in-flight chord keys across the captured key
/// stream.
#[derive(Debug)]
pub struct ChordDetector {
    enabled: bool,
    ctrl: bool,
    alt: bool,
    /// Chord keys whose release is still owed a swallow.
    pending_release: HashSet<u16>,
}

impl ChordDetector {
    /// Detector; `enabled = false` passes everything through.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ctrl: false,
            alt: false,
            pending_release: HashSet::new(),
        }
    }

    /// Classify one captured event.
    pub fn feed(&mut self, event: &Event) -> ChordOutcome {
        let Event::Key { code, pressed, .. } = *event else {
            return ChordOutcome::Pass;
        };

        match code {
            KEY_LEFTCTRL | KEY_RIGHTCTRL => {
                self.ctrl = pressed;
                return ChordOutcome::Pass;
            }
            KEY_LEFTALT | KEY_RIGHTALT => {
                self.alt = pressed;
                return ChordOutcome::Pass;
            }
            _ => {}
        }

        if !self.enabled {
            return ChordOutcome::Pass;
        }

        // The release paired with a swallowed press is swallowed too,
        // whether or not the modifiers are still down.
        if !pressed && self.pending_release.remove(&code) {
            return ChordOutcome::Swallow;
        }

        if pressed && self.ctrl && self.alt {
            let action = match code {
                KEY_1..=KEY_5 => Some(HotkeyAction::ConnectSlot((code - KEY_1 + 1) as u8)),
                KEY_0 | KEY_ESC => Some(HotkeyAction::Release),
                KEY_RIGHT => Some(HotkeyAction::Next),
                KEY_LEFT => Some(HotkeyAction::Prev),
                _ => None,
            };
            if let Some(action) = action {
                self.pending_release.insert(code);
                return ChordOutcome::Action(action);
            }
        }

        ChordOutcome::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: u16, pressed: bool) -> Event {
        Event::Key {
            code,
            pressed,
            timestamp_us: 0,
        }
    }

    #[test]
    fn chord_fires_and_swallows_press_and_release() {
        let mut detector = ChordDetector::new(true);
        assert_eq!(detector.feed(&key(KEY_LEFTCTRL, true)), ChordOutcome::Pass);
        assert_eq!(detector.feed(&key(KEY_LEFTALT, true)), ChordOutcome::Pass);
        assert_eq!(
            detector.feed(&key(KEY_1, true)),
            ChordOutcome::Action(HotkeyAction::ConnectSlot(1))
        );
        // Modifiers released before the digit: the digit release is still
        // swallowed.
        assert_eq!(detector.feed(&key(KEY_LEFTCTRL, false)), ChordOutcome::Pass);
        assert_eq!(detector.feed(&key(KEY_LEFTALT, false)), ChordOutcome::Pass);
        assert_eq!(detector.feed(&key(KEY_1, false)), ChordOutcome::Swallow);
        // A later plain 1 passes.
        assert_eq!(detector.feed(&key(KEY_1, true)), ChordOutcome::Pass);
    }

    #[test]
    fn plain_keys_pass() {
        let mut detector = ChordDetector::new(true);
        assert_eq!(detector.feed(&key(30, true)), ChordOutcome::Pass);
        assert_eq!(detector.feed(&key(KEY_1, true)), ChordOutcome::Pass);
    }

    #[test]
    fn ctrl_alt_slots_map_one_to_five() {
        let mut detector = ChordDetector::new(true);
        detector.feed(&key(KEY_RIGHTCTRL, true));
        detector.feed(&key(KEY_RIGHTALT, true));
        for (code, slot) in [(KEY_1, 1u8), (3, 2), (4, 3), (5, 4), (KEY_5, 5)] {
            assert_eq!(
                detector.feed(&key(code, true)),
                ChordOutcome::Action(HotkeyAction::ConnectSlot(slot))
            );
            detector.feed(&key(code, false));
        }
    }

    #[test]
    fn release_and_rotation_chords() {
        let mut detector = ChordDetector::new(true);
        detector.feed(&key(KEY_LEFTCTRL, true));
        detector.feed(&key(KEY_LEFTALT, true));
        assert_eq!(
            detector.feed(&key(KEY_0, true)),
            ChordOutcome::Action(HotkeyAction::Release)
        );
        assert_eq!(
            detector.feed(&key(KEY_ESC, true)),
            ChordOutcome::Action(HotkeyAction::Release)
        );
        assert_eq!(
            detector.feed(&key(KEY_RIGHT, true)),
            ChordOutcome::Action(HotkeyAction::Next)
        );
        assert_eq!(
            detector.feed(&key(KEY_LEFT, true)),
            ChordOutcome::Action(HotkeyAction::Prev)
        );
    }

    #[test]
    fn disabled_detector_passes_chords() {
        let mut detector = ChordDetector::new(false);
        detector.feed(&key(KEY_LEFTCTRL, true));
        detector.feed(&key(KEY_LEFTALT, true));
        assert_eq!(detector.feed(&key(KEY_1, true)), ChordOutcome::Pass);
    }

    #[test]
    fn mouse_events_pass() {
        let mut detector = ChordDetector::new(true);
        assert_eq!(
            detector.feed(&Event::MouseMove {
                dx: 1,
                dy: 1,
                timestamp_us: 0
            }),
            ChordOutcome::Pass
        );
    }
}
