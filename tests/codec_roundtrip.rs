//! Wire codec integration tests
//!
//! Exercises the codec laws over the public API: round-trip equality,
//! deterministic encoding, per-stream FIFO, and the tolerant/strict
//! decode behaviors sessions rely on.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use waylink::protocol::{
    codec, capabilities, ClientConfig, ControlEvent, Envelope, Event, EventCodec, FrameCodec,
    Monitor, ProtocolError, ScrollAxis, PROTOCOL_VERSION,
};

fn typing_burst() -> Vec<Envelope> {
    let mut events = Vec::new();
    // "Hello" as press/release pairs: h e l l o with a shifted H.
    for (code, shift) in [(35u16, true), (18, false), (38, false), (38, false), (24, false)] {
        if shift {
            events.push(Event::Key {
                code: 42,
                pressed: true,
                timestamp_us: events.len() as u64,
            });
        }
        events.push(Event::Key {
            code,
            pressed: true,
            timestamp_us: events.len() as u64,
        });
        events.push(Event::Key {
            code,
            pressed: false,
            timestamp_us: events.len() as u64,
        });
        if shift {
            events.push(Event::Key {
                code: 42,
                pressed: false,
                timestamp_us: events.len() as u64,
            });
        }
    }
    events.push(Event::MouseMove {
        dx: -5,
        dy: 12,
        timestamp_us: 99,
    });
    events.push(Event::MouseScroll {
        axis: ScrollAxis::Vertical,
        value: -15.0,
        steps: Some(-1),
        timestamp_us: 100,
    });
    events.into_iter().map(Envelope::from_server).collect()
}

#[test]
fn round_trip_law_over_a_realistic_stream() {
    for envelope in typing_burst() {
        let encoded = codec::encode_envelope(&envelope);
        let decoded = codec::decode_envelope(&encoded).unwrap().unwrap();
        assert_eq!(decoded, envelope);
    }
}

#[test]
fn encoding_is_byte_stable() {
    let envelope = Envelope::from_server(Event::Control(ControlEvent::ClientConfig(
        ClientConfig {
            id: "laptop".into(),
            name: "laptop.lan".into(),
            monitors: vec![Monitor {
                id: 7,
                name: "eDP-1".into(),
                x: 0,
                y: 0,
                width: 2256,
                height: 1504,
                primary: true,
                scale: 1.5,
            }],
            capabilities: capabilities::POINTER | capabilities::KEYBOARD | capabilities::SCROLL,
        },
    )));
    let first = codec::encode_envelope(&envelope);
    let second = codec::encode_envelope(&envelope);
    assert_eq!(first, second);
}

#[test]
fn framed_stream_is_fifo() {
    let mut codec = EventCodec::default();
    let mut wire = BytesMut::new();
    let burst = typing_burst();

    for envelope in &burst {
        codec.encode(envelope.clone(), &mut wire).unwrap();
    }
    for expected in &burst {
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&decoded, expected);
    }
    assert!(codec.decode(&mut wire).unwrap().is_none());
}

#[test]
fn oversized_frame_is_rejected_from_the_prefix() {
    let mut codec = EventCodec::with_max_frame(1024);
    let mut wire = BytesMut::new();
    wire.put_u32(1024 * 1024);
    // Deliberately no payload: the decision must come from the prefix.
    match codec.decode(&mut wire) {
        Err(ProtocolError::OversizedFrame { len, max }) => {
            assert_eq!(len, 1024 * 1024);
            assert_eq!(max, 1024);
        }
        other => panic!("expected OversizedFrame, got {other:?}"),
    }
}

#[test]
fn unknown_variant_frames_do_not_break_the_stream() {
    let mut event_codec = EventCodec::default();
    let mut frame_codec = FrameCodec::default();
    let mut wire = BytesMut::new();

    // A frame from a hypothetical newer build.
    let mut future = BytesMut::new();
    future.put_u8(PROTOCOL_VERSION);
    future.put_u8(250);
    future.put_u16(6);
    future.put_slice(b"server");
    future.put_slice(&[0xde, 0xad, 0xbe, 0xef]);
    frame_codec.encode(future.freeze(), &mut wire).unwrap();

    let real = Envelope::from_server(Event::Key {
        code: 57,
        pressed: true,
        timestamp_us: 1,
    });
    event_codec.encode(real.clone(), &mut wire).unwrap();

    assert_eq!(event_codec.decode(&mut wire).unwrap().unwrap(), real);
}

#[test]
fn split_delivery_reassembles() {
    let mut codec = EventCodec::default();
    let envelope = Envelope::from_server(Event::MouseButton {
        button: 272,
        pressed: true,
        timestamp_us: 55,
    });

    let mut full = BytesMut::new();
    codec.encode(envelope.clone(), &mut full).unwrap();

    // Feed the wire bytes one at a time.
    let mut trickle = BytesMut::new();
    let bytes: Vec<u8> = full.to_vec();
    for (index, byte) in bytes.iter().enumerate() {
        trickle.put_u8(*byte);
        let result = codec.decode(&mut trickle).unwrap();
        if index + 1 < bytes.len() {
            assert!(result.is_none(), "decoded early at byte {index}");
        } else {
            assert_eq!(result.unwrap(), envelope);
        }
    }
}
