//! Wire Protocol Types
//!
//! Canonical event model shared by every subsystem: the capture layer
//! produces these events, the relay routes them, the transport carries them
//! and the injector replays them. One tagged union covers input events,
//! in-band control traffic and the request/response variants used on the
//! local control socket, so a single codec serves both the TCP channel and
//! the Unix socket.
//!
//! # Wire Format
//!
//! Every message is one length-prefixed frame:
//!
//! ```text
//! ┌────────────┬─────────────────────────────────────┐
//! │ u32 (BE)   │ payload                             │
//! │ length     │ version, tag, source, variant body  │
//! └────────────┴─────────────────────────────────────┘
//! ```
//!
//! Variant tags are stable: new variants only ever append new tag numbers,
//! and a decoder that encounters a tag newer than it understands skips the
//! frame instead of failing the session. See [`codec`] for the encoding
//! rules.

pub mod codec;

pub use codec::{EventCodec, FrameCodec, ProtocolError};

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default cap on a single frame, in bytes. Frames whose length prefix
/// exceeds the cap are rejected before any buffer is allocated.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Source identifier used by events produced by device capture.
pub const SOURCE_SERVER: &str = "server";

/// One message on the wire: an event plus the identifier of whichever side
/// originated it. Capture always stamps [`SOURCE_SERVER`]; clients stamp
/// their declared id. The relay never forwards an envelope back to its
/// source.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Originating side ("server" or a client id).
    pub source: String,
    /// The event itself.
    pub event: Event,
}

impl Envelope {
    /// Envelope stamped with the capture source.
    pub fn from_server(event: Event) -> Self {
        Self {
            source: SOURCE_SERVER.to_string(),
            event,
        }
    }
}

/// Canonical event tagged union.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Relative pointer motion.
    MouseMove {
        /// Horizontal delta in device units.
        dx: i32,
        /// Vertical delta in device units.
        dy: i32,
        /// Monotonic timestamp, microseconds.
        timestamp_us: u64,
    },
    /// Pointer button press or release. Button codes are Linux evdev codes
    /// (272 = BTN_LEFT, 273 = BTN_RIGHT, ...).
    MouseButton {
        /// evdev button code.
        button: u16,
        /// true on press, false on release.
        pressed: bool,
        /// Monotonic timestamp, microseconds.
        timestamp_us: u64,
    },
    /// Scroll wheel / axis motion.
    MouseScroll {
        /// Scroll direction.
        axis: ScrollAxis,
        /// Axis value in wheel units (positive = down/right).
        value: f64,
        /// Discrete detent count when the source wheel has detents.
        steps: Option<i32>,
        /// Monotonic timestamp, microseconds.
        timestamp_us: u64,
    },
    /// Keyboard key press or release. Codes are Linux evdev key codes.
    Key {
        /// evdev key code.
        code: u16,
        /// true on press, false on release.
        pressed: bool,
        /// Monotonic timestamp, microseconds.
        timestamp_us: u64,
    },
    /// In-band control traffic.
    Control(ControlEvent),
}

impl Event {
    /// Whether this is an input event (as opposed to control traffic).
    pub fn is_input(&self) -> bool {
        !matches!(self, Event::Control(_))
    }
}

/// Control sub-variants. The first group flows over the TCP channel between
/// server and clients; the second group is the request/response vocabulary
/// of the local control socket. Both share one tag space so the codec stays
/// uniform.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Server → client: you are now receiving input.
    RequestControl,
    /// Server → client: stop receiving input, release anything held down.
    ReleaseControl,
    /// Client → server: declared identity, monitors and capabilities.
    /// Must be the first frame a client sends after authentication.
    ClientConfig(ClientConfig),
    /// Server → clients: the server is going away.
    ServerShutdown,
    /// Free-form log forwarding between peers.
    Log {
        /// Severity of the forwarded line.
        level: LogLevel,
        /// Message text.
        message: String,
    },
    /// Keepalive probe.
    Ping {
        /// Echoed back in the matching [`ControlEvent::Pong`].
        seq: u64,
    },
    /// Keepalive answer.
    Pong {
        /// Sequence from the [`ControlEvent::Ping`] being answered.
        seq: u64,
    },

    // --- control-socket vocabulary -------------------------------------

    /// Query current routing state.
    Status,
    /// Route input back to the local session.
    Release,
    /// Route input to the client at the given 1-based slot.
    Connect {
        /// Registration-order slot, 1-based.
        slot: u8,
    },
    /// Rotate or toggle the active target.
    SwitchAction(SwitchAction),
    /// Answer to [`ControlEvent::Status`].
    StatusResponse(StatusReport),
    /// Generic success answer.
    Ack,
    /// Typed failure answer.
    Err {
        /// Machine-readable kind, e.g. "no-such-slot", "cooldown".
        kind: String,
        /// Human-readable detail.
        message: String,
    },
}

/// Rotation / legacy toggle actions for [`ControlEvent::SwitchAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    /// Rotate to the next client in registration order.
    Next,
    /// Rotate to the previous client in registration order.
    Prev,
    /// Legacy name for "connect to the first client".
    Enable,
    /// Legacy name for "release".
    Disable,
}

/// Scroll direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAxis {
    /// Wheel up/down.
    Vertical,
    /// Wheel tilt / horizontal scroll.
    Horizontal,
}

/// Severity for forwarded log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Something failed.
    Error,
    /// Something looks wrong.
    Warn,
    /// Routine operational message.
    Info,
    /// Diagnostic detail.
    Debug,
}

/// Identity and topology a client declares right after authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Client-chosen stable identifier (hostname by default).
    pub id: String,
    /// Display name shown in status output.
    pub name: String,
    /// The client's monitor layout, forwarded opaquely.
    pub monitors: Vec<Monitor>,
    /// Capability bitmask, see [`capabilities`].
    pub capabilities: u32,
}

/// Capability bits carried in [`ClientConfig::capabilities`].
pub mod capabilities {
    /// Client can inject pointer events.
    pub const POINTER: u32 = 1 << 0;
    /// Client can inject keyboard events.
    pub const KEYBOARD: u32 = 1 << 1;
    /// Client can inject scroll axes.
    pub const SCROLL: u32 = 1 << 2;
}

/// One monitor in a client's declared layout.
///
/// Matches the JSON emitted by `waylink monitors --json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Monitor {
    /// Backend-assigned output id.
    pub id: u32,
    /// Output name, e.g. "DP-1".
    pub name: String,
    /// Layout X position in logical pixels.
    pub x: i32,
    /// Layout Y position in logical pixels.
    pub y: i32,
    /// Width in logical pixels.
    pub width: u32,
    /// Height in logical pixels.
    pub height: u32,
    /// Whether this is the primary output.
    pub primary: bool,
    /// Output scale factor.
    pub scale: f64,
}

/// Snapshot of routing state returned over the control socket.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Host the server is listening on.
    pub host: String,
    /// Port the server is listening on.
    pub port: u16,
    /// Active slot, 1-based; 0 means input stays local.
    pub active_slot: u32,
    /// Connected clients in registration order.
    pub clients: Vec<ClientSummary>,
}

/// One connected client inside a [`StatusReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSummary {
    /// Display name.
    pub name: String,
    /// Remote address as text.
    pub addr: String,
    /// Seconds since the session was accepted.
    pub connected_secs: u64,
    /// Whether this client currently receives input.
    pub controlled: bool,
}
