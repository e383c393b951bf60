//! Client Process Lifecycle
//!
//! The receiving role: connect to the server, announce identity and
//! monitor layout, bind the virtual input devices, and replay whatever
//! arrives. The client never captures anything and has no control socket;
//! its whole job is the receive loop.
//!
//! # Reconnection
//!
//! The connection loop never gives up: any session end short of process
//! termination — socket failure, server shutdown notice, keepalive loss —
//! tears down the virtual devices (releasing held keys first) and retries
//! with exponential backoff, 1 s doubling to a 60 s cap. A session that
//! reached the established state resets the backoff.
//!
//! A compositor without the virtual-input globals is the one fatal case:
//! retrying cannot fix it, so it aborts the client role with a clear
//! error.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::parse_host_port;
use crate::inject::{InjectError, Injector};
use crate::monitors;
use crate::protocol::{ClientConfig, ControlEvent, Envelope, Event};
use crate::transport::{
    self, ClientConnection, HandshakeStatus, TransportError, UserKey, DEAD_AFTER, PING_INTERVAL,
};

/// Reconnect backoff floor.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// What the client is currently doing, reported to the front-end callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Attempting to reach the server.
    Connecting,
    /// Connected; the operator must approve our key on the server.
    AwaitingApproval,
    /// Session up, input not currently routed here.
    Idle,
    /// Session up and this machine is receiving input.
    Controlling,
    /// Session lost; reconnecting.
    Disconnected,
}

/// Options for the client role.
pub struct ClientOptions {
    /// Server address, "host:port".
    pub server_addr: String,
    /// Private key path override.
    pub key_path: Option<std::path::PathBuf>,
    /// Display name override.
    pub name: Option<String>,
    /// Frame size cap.
    pub max_frame: usize,
}

/// Run the client until the process is told to stop.
pub async fn run(
    options: ClientOptions,
    shutdown: CancellationToken,
    on_status: impl Fn(ClientStatus) + Send + Sync + 'static,
) -> Result<()> {
    let (host, port) = parse_host_port(&options.server_addr)?;

    let user_key = UserKey::discover(options.key_path.as_deref())
        .await
        .context("no usable user key")?;

    let name = options.name.clone().unwrap_or_else(default_name);
    info!(%host, port, name = %name, "client starting");

    let mut backoff = BACKOFF_BASE;
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        on_status(ClientStatus::Connecting);
        let attempt = connect_and_serve(
            &host,
            port,
            &user_key,
            &name,
            options.max_frame,
            &shutdown,
            &on_status,
        )
        .await;

        match attempt {
            SessionEnd::Shutdown => return Ok(()),
            SessionEnd::Fatal(e) => return Err(e),
            SessionEnd::Retry { was_established } => {
                on_status(ClientStatus::Disconnected);
                if was_established {
                    backoff = BACKOFF_BASE;
                }
                debug!(delay_secs = backoff.as_secs(), "reconnecting after backoff");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

enum SessionEnd {
    /// Process-level stop.
    Shutdown,
    /// Not worth retrying (unsupported compositor, unusable key).
    Fatal(anyhow::Error),
    /// Ordinary session end; reconnect.
    Retry {
        /// Whether the session got as far as the event stream.
        was_established: bool,
    },
}

#[allow(clippy::too_many_arguments)]
async fn connect_and_serve(
    host: &str,
    port: u16,
    user_key: &UserKey,
    name: &str,
    max_frame: usize,
    shutdown: &CancellationToken,
    on_status: &(impl Fn(ClientStatus) + Send + Sync),
) -> SessionEnd {
    let connection = tokio::select! {
        _ = shutdown.cancelled() => return SessionEnd::Shutdown,
        connection = transport::connect_client(
            host,
            port,
            user_key,
            max_frame,
            |status| {
                if status == HandshakeStatus::AwaitingApproval {
                    on_status(ClientStatus::AwaitingApproval);
                }
            },
        ) => connection,
    };

    let connection = match connection {
        Ok(connection) => connection,
        Err(TransportError::Auth(e)) => {
            // Denials may be a not-yet-approved key; keep trying.
            warn!(error = %e, "authentication failed");
            return SessionEnd::Retry {
                was_established: false,
            };
        }
        Err(e) => {
            debug!(error = %e, "connection attempt failed");
            return SessionEnd::Retry {
                was_established: false,
            };
        }
    };

    info!(addr = %connection.addr, "connected and authenticated");

    // The session exists; now build the local endpoints for it.
    let injector = match Injector::bind() {
        Ok(injector) => injector,
        Err(e @ InjectError::CompositorUnsupported { .. }) => {
            return SessionEnd::Fatal(anyhow::Error::new(e).context(
                "this compositor cannot host a client (virtual input protocols missing)",
            ));
        }
        Err(e) => {
            warn!(error = %e, "cannot bind virtual devices");
            return SessionEnd::Retry {
                was_established: false,
            };
        }
    };

    serve_session(connection, injector, name, shutdown, on_status).await
}

async fn serve_session(
    mut connection: ClientConnection,
    mut injector: Injector,
    name: &str,
    shutdown: &CancellationToken,
    on_status: &(impl Fn(ClientStatus) + Send + Sync),
) -> SessionEnd {
    let declared_id = default_name();

    // First frame: who we are and what we can take.
    let monitors = match monitors::discover().await {
        Ok(monitors) => monitors,
        Err(e) => {
            debug!(error = %e, "monitor discovery failed, announcing none");
            Vec::new()
        }
    };
    let hello = Envelope {
        source: declared_id.clone(),
        event: Event::Control(ControlEvent::ClientConfig(ClientConfig {
            id: declared_id.clone(),
            name: name.to_string(),
            monitors,
            capabilities: Injector::capability_bits(),
        })),
    };
    if let Err(e) = connection.framed.send(hello).await {
        warn!(error = %e, "could not announce configuration");
        return SessionEnd::Retry {
            was_established: false,
        };
    }

    on_status(ClientStatus::Idle);

    let mut ping_seq: u64 = 0;
    let mut last_inbound = Instant::now();
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Release-before-destroy also runs on this path.
                injector.close();
                return SessionEnd::Shutdown;
            }

            _ = ping_ticker.tick() => {
                if last_inbound.elapsed() > DEAD_AFTER {
                    warn!("server unresponsive, dropping session");
                    injector.close();
                    return SessionEnd::Retry { was_established: true };
                }
                ping_seq += 1;
                let ping = Envelope {
                    source: declared_id.clone(),
                    event: Event::Control(ControlEvent::Ping { seq: ping_seq }),
                };
                if connection.framed.send(ping).await.is_err() {
                    injector.close();
                    return SessionEnd::Retry { was_established: true };
                }
            }

            frame = connection.framed.next() => {
                let envelope = match frame {
                    None => {
                        info!("server closed the connection");
                        injector.close();
                        return SessionEnd::Retry { was_established: true };
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "protocol failure");
                        injector.close();
                        return SessionEnd::Retry { was_established: true };
                    }
                    Some(Ok(envelope)) => envelope,
                };
                last_inbound = Instant::now();

                match envelope.event {
                    Event::Control(ControlEvent::RequestControl) => {
                        info!("now receiving input");
                        on_status(ClientStatus::Controlling);
                    }
                    Event::Control(ControlEvent::ReleaseControl) => {
                        info!("input released");
                        if let Err(e) = injector.release_pressed() {
                            warn!(error = %e, "release failed");
                        }
                        on_status(ClientStatus::Idle);
                    }
                    Event::Control(ControlEvent::ServerShutdown) => {
                        info!("server is shutting down");
                        injector.close();
                        return SessionEnd::Retry { was_established: true };
                    }
                    Event::Control(ControlEvent::Ping { seq }) => {
                        let pong = Envelope {
                            source: declared_id.clone(),
                            event: Event::Control(ControlEvent::Pong { seq }),
                        };
                        if connection.framed.send(pong).await.is_err() {
                            injector.close();
                            return SessionEnd::Retry { was_established: true };
                        }
                    }
                    Event::Control(ControlEvent::Pong { .. }) => {}
                    Event::Control(other) => {
                        debug!(event = ?other, "ignoring control event");
                    }
                    event => {
                        if let Err(e) = injector.inject(&event) {
                            warn!(error = %e, "injection failed, dropping session");
                            injector.close();
                            return SessionEnd::Retry { was_established: true };
                        }
                    }
                }
            }
        }
    }
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "waylink-client".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_is_nonempty() {
        assert!(!default_name().is_empty());
    }

    #[test]
    fn bad_server_addr_is_rejected_up_front() {
        let options = ClientOptions {
            server_addr: "missing-port".into(),
            key_path: None,
            name: None,
            max_frame: crate::protocol::DEFAULT_MAX_FRAME,
        };
        let shutdown = CancellationToken::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = runtime.block_on(run(options, shutdown, |_| {}));
        assert!(result.is_err());
    }
}
