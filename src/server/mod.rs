//! Server Process Lifecycle
//!
//! Orchestrates the server role: the machine that owns the physical input
//! devices and relays them. Construction follows a strict order, because
//! each subsystem leans on the previous one:
//!
//! ```text
//! config
//!   └─▶ routing core (no clients, input local)
//!         └─▶ device capture (devices opened, not grabbed)
//!               └─▶ transport listener (sessions register with the core)
//!                     └─▶ control socket (CLI helpers drive the core)
//!                           └─▶ emergency triggers
//! ```
//!
//! A failure at any step tears the already-started steps back down in
//! reverse before returning. Shutdown (SIGINT/SIGTERM) does the same after
//! broadcasting the shutdown notice to connected clients.
//!
//! The relay loop in between is small by design: pop a captured event,
//! give the hotkey detector first refusal, hand the rest to the routing
//! core.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureError, CaptureManager, EventQueue};
use crate::config::Config;
use crate::control::{socket_path, ControlService};
use crate::emergency::EmergencyTriggers;
use crate::hotkeys::{ChordDetector, ChordOutcome, HotkeyAction};
use crate::manager::{ClientManager, LogNotifier, UiNotifier, DEFAULT_COOLDOWN};
use crate::transport::{StdinPrompt, TransportServer, TrustPolicy, TrustStore};

/// Run the server until a termination signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let notifier: Arc<dyn UiNotifier> = Arc::new(LogNotifier);

    let cooldown = if config.emergency.cooldown_secs > 0 {
        std::time::Duration::from_secs(config.emergency.cooldown_secs)
    } else {
        DEFAULT_COOLDOWN
    };
    let manager = ClientManager::new(notifier.clone(), cooldown);

    // Devices open (ungrabbed) before anything can route input to them.
    let (capture, capture_errors) =
        CaptureManager::start(&config.capture, manager.grab_signal(), &shutdown)?;
    for device in capture.devices() {
        debug!(id = %device.stable_id, roles = %device.roles, "device under capture");
    }

    // Transport listener. Failure rolls back capture.
    let transport = match start_transport(&config, manager.clone(), &shutdown).await {
        Ok(transport) => transport,
        Err(e) => {
            capture.stop().await;
            return Err(e);
        }
    };

    // Control socket. Failure rolls back transport and capture.
    let control = match ControlService::bind(
        socket_path(),
        manager.clone(),
        config.server.listen_addr.clone(),
        config.server.port,
        &shutdown,
    )
    .await
    {
        Ok(control) => control,
        Err(e) => {
            transport.stop().await;
            capture.stop().await;
            return Err(e.into());
        }
    };

    let emergency = EmergencyTriggers::start(&config.emergency, manager.clone(), &shutdown);

    let relay = tokio::spawn(relay_loop(
        capture.queue(),
        manager.clone(),
        ChordDetector::new(config.hotkeys.enabled),
        shutdown.child_token(),
    ));
    let error_surface = tokio::spawn(surface_capture_errors(capture_errors, notifier.clone()));

    info!(
        port = config.server.port,
        "server up; input stays local until a switch"
    );

    wait_for_termination().await;
    info!("shutting down");

    // Reverse of startup: tell clients first, then close the surfaces,
    // then release the devices.
    manager.notify_shutdown().await;
    shutdown.cancel();
    let _ = relay.await;
    let _ = error_surface.await;
    control.stop().await;
    transport.stop().await;
    capture.stop().await;
    emergency.stop().await;

    info!("shutdown complete");
    Ok(())
}

async fn start_transport(
    config: &Config,
    manager: Arc<ClientManager>,
    shutdown: &CancellationToken,
) -> Result<TransportServer> {
    let host_key = crate::transport::keys::load_or_generate_host_key(&config.server.host_key_path)
        .context("host key unavailable")?;

    let policy = TrustPolicy::parse(&config.server.trust_policy)
        .context("invalid trust policy")?;
    let trust = Arc::new(
        TrustStore::load(&config.server.trust_store_path, policy)
            .context("cannot load trust store")?,
    );

    let transport = TransportServer::bind(
        &config.server.listen_addr,
        config.server.port,
        host_key,
        trust,
        Arc::new(StdinPrompt),
        manager,
        config.server.max_frame_size,
        shutdown,
    )
    .await?;
    Ok(transport)
}

/// Pump captured events into the routing core, with the hotkey detector
/// getting first refusal on every key.
async fn relay_loop(
    queue: Arc<EventQueue>,
    manager: Arc<ClientManager>,
    mut chords: ChordDetector,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = queue.pop() => event,
        };

        match chords.feed(&event) {
            ChordOutcome::Pass => manager.handle_input_event(event).await,
            ChordOutcome::Swallow => {}
            ChordOutcome::Action(action) => {
                let result = match action {
                    HotkeyAction::ConnectSlot(slot) => {
                        manager.connect_slot(slot as usize).await
                    }
                    HotkeyAction::Release => {
                        manager.switch_to_local().await;
                        Ok(())
                    }
                    HotkeyAction::Next => manager.switch_to_next().await,
                    HotkeyAction::Prev => manager.switch_to_prev().await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "hotkey switch refused");
                }
            }
        }
    }
}

async fn surface_capture_errors(
    mut errors: mpsc::UnboundedReceiver<CaptureError>,
    notifier: Arc<dyn UiNotifier>,
) {
    while let Some(e) = errors.recv().await {
        match &e {
            CaptureError::BusyDevice { .. } => {
                notifier.surface_error("device-busy", &e.to_string())
            }
            CaptureError::DeviceGone { .. } => {
                notifier.surface_error("device-gone", &e.to_string())
            }
            _ => error!(error = %e, "capture failure"),
        }
    }
}

async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
