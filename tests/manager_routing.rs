//! Routing scenarios
//!
//! End-to-end switching sequences against the routing core: the
//! two-client relay dance, emergency release with cooldown, and the
//! local/remote bookkeeping invariants.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use waylink::manager::{
    ActiveTarget, ClientHello, ClientManager, ReleaseReason, RoutingError, SessionSender,
    UiNotifier,
};
use waylink::protocol::{ControlEvent, Envelope, Event};

struct QuietNotifier;
impl UiNotifier for QuietNotifier {
    fn target_changed(&self, _: &ActiveTarget, _: Option<&str>) {}
    fn input_activity(&self, _: u32) {}
    fn surface_error(&self, _: &str, _: &str) {}
}

fn manager() -> Arc<ClientManager> {
    ClientManager::new(Arc::new(QuietNotifier), Duration::from_millis(150))
}

async fn register(
    manager: &Arc<ClientManager>,
    declared: &str,
    name: &str,
) -> (u64, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(128);
    let id = manager
        .register_client(
            ClientHello {
                declared_id: declared.into(),
                name: name.into(),
                addr: "10.1.0.3:9000".parse().unwrap(),
                monitors: vec![],
                capabilities: 0,
            },
            SessionSender::new(tx),
        )
        .await;
    (id, rx)
}

fn key(code: u16, pressed: bool) -> Event {
    Event::Key {
        code,
        pressed,
        timestamp_us: 0,
    }
}

/// Pull frames until the next input event, asserting the control frames
/// seen along the way.
async fn next_input(rx: &mut mpsc::Receiver<Envelope>) -> Event {
    loop {
        match rx.recv().await.expect("stream ended") {
            Envelope {
                event: Event::Control(_),
                ..
            } => continue,
            Envelope { event, .. } => return event,
        }
    }
}

#[tokio::test]
async fn two_client_switch_delivers_to_the_right_machine() {
    let m = manager();
    let (a, mut rx_a) = register(&m, "a", "alpha").await;
    let (b, mut rx_b) = register(&m, "b", "beta").await;

    // connect 1, type 'a' (KEY_A = 30)
    m.connect_slot(1).await.unwrap();
    assert_eq!(m.active_target().await, ActiveTarget::Client(a));
    m.handle_input_event(key(30, true)).await;
    m.handle_input_event(key(30, false)).await;

    // connect 2, type 'b' (KEY_B = 48)
    m.connect_slot(2).await.unwrap();
    assert_eq!(m.active_target().await, ActiveTarget::Client(b));
    m.handle_input_event(key(48, true)).await;
    m.handle_input_event(key(48, false)).await;

    // release
    m.switch_to_local().await;
    assert!(m.is_controlling_local().await);

    // A saw only the 'a' press/release.
    assert_eq!(next_input(&mut rx_a).await, key(30, true));
    assert_eq!(next_input(&mut rx_a).await, key(30, false));
    // Then nothing but control frames (ReleaseControl) remain.
    while let Ok(envelope) = rx_a.try_recv() {
        assert!(
            matches!(envelope.event, Event::Control(_)),
            "A received input meant for B: {:?}",
            envelope.event
        );
    }

    // B saw only the 'b' press/release.
    assert_eq!(next_input(&mut rx_b).await, key(48, true));
    assert_eq!(next_input(&mut rx_b).await, key(48, false));
    while let Ok(envelope) = rx_b.try_recv() {
        assert!(matches!(envelope.event, Event::Control(_)));
    }
}

#[tokio::test]
async fn control_frames_bracket_the_input_stream() {
    let m = manager();
    let (_a, mut rx) = register(&m, "a", "alpha").await;

    m.connect_slot(1).await.unwrap();
    m.handle_input_event(key(30, true)).await;
    m.switch_to_local().await;

    // Exact order: RequestControl, the key, ReleaseControl.
    let frames: Vec<Event> = {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.event);
        }
        out
    };
    assert_eq!(
        frames,
        vec![
            Event::Control(ControlEvent::RequestControl),
            key(30, true),
            Event::Control(ControlEvent::ReleaseControl),
        ]
    );
}

#[tokio::test]
async fn emergency_release_blocks_switches_until_cooldown_expires() {
    let m = manager();
    let (_a, _rx) = register(&m, "a", "alpha").await;

    m.connect_slot(1).await.unwrap();
    m.emergency_release(ReleaseReason::Signal).await;
    assert_eq!(m.active_target().await, ActiveTarget::Local);

    // Within the cooldown interval the switch is refused.
    match m.connect_slot(1).await {
        Err(RoutingError::Cooldown { remaining_ms }) => assert!(remaining_ms > 0),
        other => panic!("expected cooldown, got {other:?}"),
    }

    // After it, the same request succeeds.
    tokio::time::sleep(Duration::from_millis(200)).await;
    m.connect_slot(1).await.unwrap();
    assert_ne!(m.active_target().await, ActiveTarget::Local);
}

#[tokio::test]
async fn registered_set_and_slots_survive_churn() {
    let m = manager();
    let (_a, _rx_a) = register(&m, "a", "alpha").await;
    let (b, _rx_b) = register(&m, "b", "beta").await;
    let (_c, _rx_c) = register(&m, "c", "gamma").await;

    // Unregister the middle client; slots renumber by registration order.
    m.unregister_client(b).await;
    let report = m.status_report("0.0.0.0", 52525).await;
    assert_eq!(report.clients.len(), 2);
    assert_eq!(report.clients[0].name, "alpha");
    assert_eq!(report.clients[1].name, "gamma");

    m.connect_slot(2).await.unwrap();
    let report = m.status_report("0.0.0.0", 52525).await;
    assert_eq!(report.active_slot, 2);
    assert!(report.clients[1].controlled);
}

#[tokio::test]
async fn local_flag_tracks_active_target() {
    let m = manager();
    let (a, _rx) = register(&m, "a", "alpha").await;

    assert!(m.is_controlling_local().await);
    m.switch_to_client(a).await.unwrap();
    assert!(!m.is_controlling_local().await);
    m.switch_to_local().await;
    assert!(m.is_controlling_local().await);
}
