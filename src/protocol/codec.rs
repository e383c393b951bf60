//! Framed Binary Codec
//!
//! Length-prefixed, tag-numbered encoding of [`Envelope`]. The encoding is
//! deterministic: identical envelopes always produce identical bytes, which
//! the test suites rely on. Decoding is tolerant in exactly one direction:
//! a frame whose variant tag is newer than this build understands is
//! skipped, everything else that does not parse is an error.
//!
//! Two codec layers are exposed:
//!
//! - [`FrameCodec`] splits the byte stream into frames (4-byte big-endian
//!   length prefix, configurable size cap). The cap is enforced against the
//!   prefix before any payload buffer is reserved, so an oversized frame is
//!   rejected without allocating.
//! - [`EventCodec`] composes framing with payload encoding and yields whole
//!   [`Envelope`]s, silently skipping unknown-variant frames.
//!
//! The authentication handshake reuses [`FrameCodec`] with its own payload
//! layout; everything after the handshake flows through [`EventCodec`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::{
    ClientConfig, ClientSummary, ControlEvent, Envelope, Event, LogLevel, Monitor, ScrollAxis,
    StatusReport, SwitchAction, DEFAULT_MAX_FRAME, PROTOCOL_VERSION,
};

/// Wire tags for the event union. Append-only.
mod tag {
    pub const MOUSE_MOVE: u8 = 1;
    pub const MOUSE_BUTTON: u8 = 2;
    pub const MOUSE_SCROLL: u8 = 3;
    pub const KEY: u8 = 4;
    pub const CONTROL: u8 = 5;

    /// Highest event tag this build understands.
    pub const MAX_EVENT: u8 = CONTROL;
}

/// Wire tags for control sub-variants. Append-only; 16.. is the
/// control-socket vocabulary.
mod ctl {
    pub const REQUEST_CONTROL: u8 = 1;
    pub const RELEASE_CONTROL: u8 = 2;
    pub const CLIENT_CONFIG: u8 = 3;
    pub const SERVER_SHUTDOWN: u8 = 4;
    pub const LOG: u8 = 5;
    pub const PING: u8 = 6;
    pub const PONG: u8 = 7;

    pub const STATUS: u8 = 16;
    pub const RELEASE: u8 = 17;
    pub const CONNECT: u8 = 18;
    pub const SWITCH_ACTION: u8 = 19;
    pub const STATUS_RESPONSE: u8 = 20;
    pub const ACK: u8 = 21;
    pub const ERR: u8 = 22;

    /// Highest control tag this build understands.
    pub const MAX_CONTROL: u8 = ERR;
}

/// Codec and framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload shorter than its fields claim, bad UTF-8, or a zero tag
    /// where the frame layout requires one.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A required tag slot held no recognizable value.
    #[error("unknown variant in {context}: tag {tag}")]
    UnknownVariant {
        /// Which tag space was being read.
        context: &'static str,
        /// The offending byte.
        tag: u8,
    },

    /// Length prefix exceeded the configured cap.
    #[error("oversized frame: {len} bytes exceeds cap of {max}")]
    OversizedFrame {
        /// Claimed payload length.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// Underlying stream failure.
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Frame layer
// ---------------------------------------------------------------------------

/// Splits a byte stream into length-prefixed frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Frame codec with the given size cap.
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            // Reject on the prefix alone; the payload is never buffered.
            return Err(ProtocolError::OversizedFrame {
                len,
                max: self.max_frame,
            });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if payload.len() > self.max_frame {
            return Err(ProtocolError::OversizedFrame {
                len: payload.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Envelope layer
// ---------------------------------------------------------------------------

/// Frames plus payload encoding: the codec used on every session after
/// authentication, and on the local control socket.
#[derive(Debug, Clone, Default)]
pub struct EventCodec {
    frames: FrameCodec,
}

impl EventCodec {
    /// Event codec with a custom frame cap.
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            frames: FrameCodec::new(max_frame),
        }
    }
}

impl Decoder for EventCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        // Unknown-variant frames decode to nothing; keep consuming frames
        // until one yields an envelope or the buffer runs dry.
        loop {
            let Some(payload) = self.frames.decode(src)? else {
                return Ok(None);
            };
            match decode_envelope(&payload)? {
                Some(envelope) => return Ok(Some(envelope)),
                None => {
                    trace!("skipping frame with unknown variant tag");
                    continue;
                }
            }
        }
    }
}

impl Encoder<Envelope> for EventCodec {
    type Error = ProtocolError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.frames.encode(encode_envelope(&envelope), dst)
    }
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

/// Encode one envelope into a frame payload (without the length prefix).
pub fn encode_envelope(envelope: &Envelope) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(PROTOCOL_VERSION);
    match &envelope.event {
        Event::MouseMove {
            dx,
            dy,
            timestamp_us,
        } => {
            buf.put_u8(tag::MOUSE_MOVE);
            put_str(&mut buf, &envelope.source);
            buf.put_i32(*dx);
            buf.put_i32(*dy);
            buf.put_u64(*timestamp_us);
        }
        Event::MouseButton {
            button,
            pressed,
            timestamp_us,
        } => {
            buf.put_u8(tag::MOUSE_BUTTON);
            put_str(&mut buf, &envelope.source);
            buf.put_u16(*button);
            buf.put_u8(*pressed as u8);
            buf.put_u64(*timestamp_us);
        }
        Event::MouseScroll {
            axis,
            value,
            steps,
            timestamp_us,
        } => {
            buf.put_u8(tag::MOUSE_SCROLL);
            put_str(&mut buf, &envelope.source);
            buf.put_u8(match axis {
                ScrollAxis::Vertical => 0,
                ScrollAxis::Horizontal => 1,
            });
            buf.put_f64(*value);
            match steps {
                Some(steps) => {
                    buf.put_u8(1);
                    buf.put_i32(*steps);
                }
                None => buf.put_u8(0),
            }
            buf.put_u64(*timestamp_us);
        }
        Event::Key {
            code,
            pressed,
            timestamp_us,
        } => {
            buf.put_u8(tag::KEY);
            put_str(&mut buf, &envelope.source);
            buf.put_u16(*code);
            buf.put_u8(*pressed as u8);
            buf.put_u64(*timestamp_us);
        }
        Event::Control(control) => {
            buf.put_u8(tag::CONTROL);
            put_str(&mut buf, &envelope.source);
            encode_control(&mut buf, control);
        }
    }
    buf.freeze()
}

fn encode_control(buf: &mut BytesMut, control: &ControlEvent) {
    match control {
        ControlEvent::RequestControl => buf.put_u8(ctl::REQUEST_CONTROL),
        ControlEvent::ReleaseControl => buf.put_u8(ctl::RELEASE_CONTROL),
        ControlEvent::ClientConfig(config) => {
            buf.put_u8(ctl::CLIENT_CONFIG);
            put_str(buf, &config.id);
            put_str(buf, &config.name);
            buf.put_u16(config.monitors.len() as u16);
            for monitor in &config.monitors {
                buf.put_u32(monitor.id);
                put_str(buf, &monitor.name);
                buf.put_i32(monitor.x);
                buf.put_i32(monitor.y);
                buf.put_u32(monitor.width);
                buf.put_u32(monitor.height);
                buf.put_u8(monitor.primary as u8);
                buf.put_f64(monitor.scale);
            }
            buf.put_u32(config.capabilities);
        }
        ControlEvent::ServerShutdown => buf.put_u8(ctl::SERVER_SHUTDOWN),
        ControlEvent::Log { level, message } => {
            buf.put_u8(ctl::LOG);
            buf.put_u8(match level {
                LogLevel::Error => 0,
                LogLevel::Warn => 1,
                LogLevel::Info => 2,
                LogLevel::Debug => 3,
            });
            put_str(buf, message);
        }
        ControlEvent::Ping { seq } => {
            buf.put_u8(ctl::PING);
            buf.put_u64(*seq);
        }
        ControlEvent::Pong { seq } => {
            buf.put_u8(ctl::PONG);
            buf.put_u64(*seq);
        }
        ControlEvent::Status => buf.put_u8(ctl::STATUS),
        ControlEvent::Release => buf.put_u8(ctl::RELEASE),
        ControlEvent::Connect { slot } => {
            buf.put_u8(ctl::CONNECT);
            buf.put_u8(*slot);
        }
        ControlEvent::SwitchAction(action) => {
            buf.put_u8(ctl::SWITCH_ACTION);
            buf.put_u8(match action {
                SwitchAction::Next => 1,
                SwitchAction::Prev => 2,
                SwitchAction::Enable => 3,
                SwitchAction::Disable => 4,
            });
        }
        ControlEvent::StatusResponse(report) => {
            buf.put_u8(ctl::STATUS_RESPONSE);
            put_str(buf, &report.host);
            buf.put_u16(report.port);
            buf.put_u32(report.active_slot);
            buf.put_u16(report.clients.len() as u16);
            for client in &report.clients {
                put_str(buf, &client.name);
                put_str(buf, &client.addr);
                buf.put_u64(client.connected_secs);
                buf.put_u8(client.controlled as u8);
            }
        }
        ControlEvent::Ack => buf.put_u8(ctl::ACK),
        ControlEvent::Err { kind, message } => {
            buf.put_u8(ctl::ERR);
            put_str(buf, kind);
            put_str(buf, message);
        }
    }
}

/// Decode one frame payload. `Ok(None)` means the frame carried a variant
/// tag newer than this build and was skipped.
pub fn decode_envelope(payload: &[u8]) -> Result<Option<Envelope>, ProtocolError> {
    let mut buf = payload;

    let version = get_u8(&mut buf)?;
    if version == 0 {
        return Err(ProtocolError::MalformedFrame("zero protocol version"));
    }

    let event_tag = get_u8(&mut buf)?;
    if event_tag == 0 {
        return Err(ProtocolError::UnknownVariant {
            context: "event",
            tag: 0,
        });
    }
    if event_tag > tag::MAX_EVENT {
        return Ok(None);
    }

    let source = get_str(&mut buf)?;

    let event = match event_tag {
        tag::MOUSE_MOVE => Event::MouseMove {
            dx: get_i32(&mut buf)?,
            dy: get_i32(&mut buf)?,
            timestamp_us: get_u64(&mut buf)?,
        },
        tag::MOUSE_BUTTON => Event::MouseButton {
            button: get_u16(&mut buf)?,
            pressed: get_u8(&mut buf)? != 0,
            timestamp_us: get_u64(&mut buf)?,
        },
        tag::MOUSE_SCROLL => {
            let axis = match get_u8(&mut buf)? {
                0 => ScrollAxis::Vertical,
                1 => ScrollAxis::Horizontal,
                // A scroll direction this build does not know about.
                _ => return Ok(None),
            };
            let value = get_f64(&mut buf)?;
            let steps = if get_u8(&mut buf)? != 0 {
                Some(get_i32(&mut buf)?)
            } else {
                None
            };
            Event::MouseScroll {
                axis,
                value,
                steps,
                timestamp_us: get_u64(&mut buf)?,
            }
        }
        tag::KEY => Event::Key {
            code: get_u16(&mut buf)?,
            pressed: get_u8(&mut buf)? != 0,
            timestamp_us: get_u64(&mut buf)?,
        },
        tag::CONTROL => match decode_control(&mut buf)? {
            Some(control) => Event::Control(control),
            None => return Ok(None),
        },
        _ => unreachable!("tag bounds checked above"),
    };

    // Trailing bytes are additive fields from a newer peer; ignore them.
    Ok(Some(Envelope { source, event }))
}

fn decode_control(buf: &mut &[u8]) -> Result<Option<ControlEvent>, ProtocolError> {
    let sub = get_u8(buf)?;
    if sub == 0 {
        return Err(ProtocolError::UnknownVariant {
            context: "control",
            tag: 0,
        });
    }
    if sub > ctl::MAX_CONTROL {
        return Ok(None);
    }

    let control = match sub {
        ctl::REQUEST_CONTROL => ControlEvent::RequestControl,
        ctl::RELEASE_CONTROL => ControlEvent::ReleaseControl,
        ctl::CLIENT_CONFIG => {
            let id = get_str(buf)?;
            let name = get_str(buf)?;
            let count = get_u16(buf)? as usize;
            let mut monitors = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                monitors.push(Monitor {
                    id: get_u32(buf)?,
                    name: get_str(buf)?,
                    x: get_i32(buf)?,
                    y: get_i32(buf)?,
                    width: get_u32(buf)?,
                    height: get_u32(buf)?,
                    primary: get_u8(buf)? != 0,
                    scale: get_f64(buf)?,
                });
            }
            ControlEvent::ClientConfig(ClientConfig {
                id,
                name,
                monitors,
                capabilities: get_u32(buf)?,
            })
        }
        ctl::SERVER_SHUTDOWN => ControlEvent::ServerShutdown,
        ctl::LOG => {
            let level = match get_u8(buf)? {
                0 => LogLevel::Error,
                1 => LogLevel::Warn,
                2 => LogLevel::Info,
                _ => LogLevel::Debug,
            };
            ControlEvent::Log {
                level,
                message: get_str(buf)?,
            }
        }
        ctl::PING => ControlEvent::Ping { seq: get_u64(buf)? },
        ctl::PONG => ControlEvent::Pong { seq: get_u64(buf)? },
        ctl::STATUS => ControlEvent::Status,
        ctl::RELEASE => ControlEvent::Release,
        ctl::CONNECT => ControlEvent::Connect { slot: get_u8(buf)? },
        ctl::SWITCH_ACTION => match get_u8(buf)? {
            1 => ControlEvent::SwitchAction(SwitchAction::Next),
            2 => ControlEvent::SwitchAction(SwitchAction::Prev),
            3 => ControlEvent::SwitchAction(SwitchAction::Enable),
            4 => ControlEvent::SwitchAction(SwitchAction::Disable),
            0 => {
                return Err(ProtocolError::UnknownVariant {
                    context: "switch-action",
                    tag: 0,
                })
            }
            _ => return Ok(None),
        },
        ctl::STATUS_RESPONSE => {
            let host = get_str(buf)?;
            let port = get_u16(buf)?;
            let active_slot = get_u32(buf)?;
            let count = get_u16(buf)? as usize;
            let mut clients = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                clients.push(ClientSummary {
                    name: get_str(buf)?,
                    addr: get_str(buf)?,
                    connected_secs: get_u64(buf)?,
                    controlled: get_u8(buf)? != 0,
                });
            }
            ControlEvent::StatusResponse(StatusReport {
                host,
                port,
                active_slot,
                clients,
            })
        }
        ctl::ACK => ControlEvent::Ack,
        ctl::ERR => ControlEvent::Err {
            kind: get_str(buf)?,
            message: get_str(buf)?,
        },
        _ => unreachable!("tag bounds checked above"),
    };

    Ok(Some(control))
}

// ---------------------------------------------------------------------------
// Primitive readers/writers
// ---------------------------------------------------------------------------

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn need(buf: &[u8], n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::MalformedFrame("payload truncated"));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut &[u8]) -> Result<u16, ProtocolError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_i32(buf: &mut &[u8]) -> Result<i32, ProtocolError> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_u64(buf: &mut &[u8]) -> Result<u64, ProtocolError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_f64(buf: &mut &[u8]) -> Result<f64, ProtocolError> {
    need(buf, 8)?;
    Ok(buf.get_f64())
}

pub(crate) fn get_str(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = get_u16(buf)? as usize;
    need(buf, len)?;
    let (head, rest) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| ProtocolError::MalformedFrame("invalid UTF-8 in string field"))?
        .to_string();
    *buf = rest;
    Ok(s)
}
