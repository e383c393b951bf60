//! Control socket integration tests
//!
//! Drives a live Unix-socket service the way the CLI helpers do: status
//! queries, slot switches, release, and the helper-visible failure modes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use waylink::control::{self, ControlError, ControlService};
use waylink::manager::{ActiveTarget, ClientHello, ClientManager, SessionSender, UiNotifier};
use waylink::protocol::{ControlEvent, Envelope, StatusReport, SwitchAction};

struct QuietNotifier;
impl UiNotifier for QuietNotifier {
    fn target_changed(&self, _: &ActiveTarget, _: Option<&str>) {}
    fn input_activity(&self, _: u32) {}
    fn surface_error(&self, _: &str, _: &str) {}
}

async fn setup(
    dir: &tempfile::TempDir,
    client_names: &[&str],
) -> (Arc<ClientManager>, ControlService, Vec<mpsc::Receiver<Envelope>>) {
    let manager = ClientManager::new(Arc::new(QuietNotifier), Duration::from_millis(100));

    let mut receivers = Vec::new();
    for name in client_names {
        let (tx, rx) = mpsc::channel(64);
        manager
            .register_client(
                ClientHello {
                    declared_id: name.to_string(),
                    name: name.to_string(),
                    addr: "10.2.0.4:7000".parse().unwrap(),
                    monitors: vec![],
                    capabilities: 0,
                },
                SessionSender::new(tx),
            )
            .await;
        receivers.push(rx);
    }

    let shutdown = CancellationToken::new();
    let service = ControlService::bind(
        dir.path().join("waylink.sock"),
        manager.clone(),
        "0.0.0.0".into(),
        52525,
        &shutdown,
    )
    .await
    .unwrap();

    (manager, service, receivers)
}

async fn status(service: &ControlService) -> StatusReport {
    match control::request(service.path(), ControlEvent::Status)
        .await
        .unwrap()
    {
        ControlEvent::StatusResponse(report) => report,
        other => panic!("expected StatusResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn status_shows_names_in_registration_order() {
    let dir = tempfile::tempdir().unwrap();
    let (_manager, service, _rx) = setup(&dir, &["alpha", "beta"]).await;

    let report = status(&service).await;
    assert_eq!(report.host, "0.0.0.0");
    assert_eq!(report.port, 52525);
    assert_eq!(report.active_slot, 0);
    let names: Vec<_> = report.clients.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["alpha", "beta"]);

    service.stop().await;
}

#[tokio::test]
async fn connect_then_release_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, service, _rx) = setup(&dir, &["alpha", "beta"]).await;

    // Helper connects slot 2; status reflects it.
    assert_eq!(
        control::request(service.path(), ControlEvent::Connect { slot: 2 })
            .await
            .unwrap(),
        ControlEvent::Ack
    );
    assert_eq!(status(&service).await.active_slot, 2);
    assert!(!manager.is_controlling_local().await);

    // Helper releases; status shows local again.
    assert_eq!(
        control::request(service.path(), ControlEvent::Release)
            .await
            .unwrap(),
        ControlEvent::Ack
    );
    assert_eq!(status(&service).await.active_slot, 0);
    assert!(manager.is_controlling_local().await);

    service.stop().await;
}

#[tokio::test]
async fn switch_rotates_through_slots() {
    let dir = tempfile::tempdir().unwrap();
    let (_manager, service, _rx) = setup(&dir, &["alpha", "beta"]).await;

    for expected_slot in [1, 2, 1] {
        assert_eq!(
            control::request(
                service.path(),
                ControlEvent::SwitchAction(SwitchAction::Next)
            )
            .await
            .unwrap(),
            ControlEvent::Ack
        );
        assert_eq!(status(&service).await.active_slot, expected_slot);
    }

    service.stop().await;
}

#[tokio::test]
async fn bad_slot_reports_no_such_slot() {
    let dir = tempfile::tempdir().unwrap();
    let (_manager, service, _rx) = setup(&dir, &["alpha"]).await;

    match control::request(service.path(), ControlEvent::Connect { slot: 5 })
        .await
        .unwrap()
    {
        ControlEvent::Err { kind, message } => {
            assert_eq!(kind, "no-such-slot");
            assert!(message.contains('5'));
        }
        other => panic!("expected error, got {other:?}"),
    }

    service.stop().await;
}

#[tokio::test]
async fn sequential_requests_on_one_connection_are_serialized() {
    // The protocol allows one in-flight request per connection; a helper
    // reusing its connection sees answers in request order.
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;
    use waylink::protocol::{Event, EventCodec};

    let dir = tempfile::tempdir().unwrap();
    let (_manager, service, _rx) = setup(&dir, &["alpha"]).await;

    let stream = tokio::net::UnixStream::connect(service.path()).await.unwrap();
    let mut framed = Framed::new(stream, EventCodec::default());

    for request in [
        ControlEvent::Status,
        ControlEvent::Connect { slot: 1 },
        ControlEvent::Status,
        ControlEvent::Release,
    ] {
        framed
            .send(Envelope {
                source: "cli".into(),
                event: Event::Control(request.clone()),
            })
            .await
            .unwrap();
        let response = framed.next().await.unwrap().unwrap();
        match (request, response.event) {
            (ControlEvent::Status, Event::Control(ControlEvent::StatusResponse(_))) => {}
            (ControlEvent::Connect { .. }, Event::Control(ControlEvent::Ack)) => {}
            (ControlEvent::Release, Event::Control(ControlEvent::Ack)) => {}
            (request, response) => panic!("mismatched reply {response:?} to {request:?}"),
        }
    }

    service.stop().await;
}

#[tokio::test]
async fn helper_reports_server_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nobody-home.sock");
    match control::request(&path, ControlEvent::Status).await {
        Err(ControlError::NotRunning { .. }) => {}
        other => panic!("expected NotRunning, got {other:?}"),
    }
}
