//! Emergency Release
//!
//! Out-of-band paths that force input back to the local session when the
//! normal ones are unreachable — which is exactly the situation an input
//! relay gets you into: if the active client wedges, the keyboard that
//! would fix it is grabbed.
//!
//! Three triggers run as independent tasks:
//!
//! 1. **Signal** — SIGUSR1 delivered to the server process
//!    (`pkill -USR1 waylink` from another TTY or over SSH).
//! 2. **Inactivity** — no captured input for the configured window while a
//!    remote client is active.
//! 3. **Marker file** — a well-known path whose mere existence releases;
//!    `touch /tmp/waylink-release` works from anything that can write a
//!    file. The marker is deleted after it fires.
//!
//! Any trigger funnels into the routing core's emergency path, which also
//! starts the switch cooldown so a queued hotkey cannot instantly undo
//! the release.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EmergencyConfig;
use crate::manager::{ActiveTarget, ClientManager, ReleaseReason};

/// Poll cadence for the inactivity and marker-file triggers.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the three running trigger tasks.
pub struct EmergencyTriggers {
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl EmergencyTriggers {
    /// Start all triggers.
    pub fn start(
        config: &EmergencyConfig,
        manager: Arc<ClientManager>,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancel = shutdown.child_token();
        let inactivity_timeout = Duration::from_secs(config.inactivity_timeout_secs);

        let tasks = vec![
            tokio::spawn(signal_trigger(manager.clone(), cancel.clone())),
            tokio::spawn(inactivity_trigger(
                manager.clone(),
                inactivity_timeout,
                cancel.clone(),
            )),
            tokio::spawn(marker_trigger(
                manager,
                config.marker_path.clone(),
                cancel.clone(),
            )),
        ];

        info!(
            inactivity_secs = config.inactivity_timeout_secs,
            marker = %config.marker_path.display(),
            "emergency triggers armed"
        );

        Self { tasks, cancel }
    }

    /// Stop all triggers.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        debug!("emergency triggers stopped");
    }
}

async fn signal_trigger(manager: Arc<ClientManager>, cancel: CancellationToken) {
    let mut stream = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGUSR1 handler; signal trigger disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = stream.recv() => {
                if received.is_none() {
                    return;
                }
                manager.emergency_release(ReleaseReason::Signal).await;
            }
        }
    }
}

async fn inactivity_trigger(
    manager: Arc<ClientManager>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if manager.active_target().await == ActiveTarget::Local {
                    continue;
                }
                let idle = manager.last_activity_age().await;
                if idle >= timeout {
                    warn!(idle_secs = idle.as_secs(), "no input while controlling a remote");
                    manager.emergency_release(ReleaseReason::Inactivity).await;
                }
            }
        }
    }
}

async fn marker_trigger(
    manager: Arc<ClientManager>,
    marker: PathBuf,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if !marker.exists() {
                    continue;
                }
                // Consume the marker so it fires once per touch.
                if let Err(e) = std::fs::remove_file(&marker) {
                    warn!(path = %marker.display(), error = %e, "cannot remove marker file");
                }
                manager.emergency_release(ReleaseReason::MarkerFile).await;
            }
        }
    }
}
