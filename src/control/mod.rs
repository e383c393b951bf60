//! Local Control Socket
//!
//! Unix-domain request/response service that lets command-line helpers
//! drive a running server without a terminal UI. Requests and responses
//! are the same framed codec as the network channel, using the
//! control-socket vocabulary (`Status`, `Release`, `Connect`,
//! `SwitchAction`, answered by `StatusResponse`, `Ack`, `Err`).
//!
//! The socket lives at `/tmp/waylink.sock` when the server runs as root,
//! otherwise under the user's runtime directory. A bound socket is the
//! authoritative "server is running" signal: helpers treat a connection
//! refusal as "not running", and the server treats a connectable existing
//! socket as an already-running instance.
//!
//! Requests are serialized: one in-flight request per connection, answered
//! before the next is read.

use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::APP_NAME;
use crate::manager::ClientManager;
use crate::protocol::{ControlEvent, Envelope, Event, EventCodec, ProtocolError, SwitchAction};

/// Control socket failures.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Another server instance already owns the socket.
    #[error("a server is already running at {path}")]
    AlreadyRunning {
        /// The occupied socket path.
        path: PathBuf,
    },

    /// The socket could not be created.
    #[error("cannot bind control socket {path}: {source}")]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// No server is listening (helper side).
    #[error("server is not running (no socket at {path})")]
    NotRunning {
        /// The socket path probed.
        path: PathBuf,
    },

    /// Frame-level failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer answered with something that is not a response variant.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Request/response exchange failed mid-way.
    #[error("control socket I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the control socket lives for this process.
///
/// Root servers use the fixed `/tmp` path so unprivileged helpers can
/// still find them; user servers use the per-user runtime directory.
pub fn socket_path() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        return PathBuf::from(format!("/tmp/{APP_NAME}.sock"));
    }
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(format!("{APP_NAME}.sock"))
}

// ---------------------------------------------------------------------------
// Service side
// ---------------------------------------------------------------------------

/// The bound control socket and its accept loop.
pub struct ControlService {
    path: PathBuf,
    accept_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ControlService {
    /// Bind the socket and start serving requests.
    ///
    /// An existing socket file is probed first: if something answers, a
    /// server is already running and binding fails; a stale file from a
    /// crashed instance is removed.
    pub async fn bind(
        path: PathBuf,
        manager: Arc<ClientManager>,
        server_host: String,
        server_port: u16,
        shutdown: &CancellationToken,
    ) -> Result<Self, ControlError> {
        if path.exists() {
            match UnixStream::connect(&path).await {
                Ok(_) => return Err(ControlError::AlreadyRunning { path }),
                Err(_) => {
                    debug!(path = %path.display(), "removing stale control socket");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&path).map_err(|source| ControlError::Bind {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "control socket ready");

        let cancel = shutdown.child_token();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            manager,
            server_host,
            server_port,
            cancel.clone(),
        ));

        Ok(Self {
            path,
            accept_task,
            cancel,
        })
    }

    /// The bound socket path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Stop serving and remove the socket file.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
        let _ = std::fs::remove_file(&self.path);
        debug!("control socket closed");
    }
}

async fn accept_loop(
    listener: UnixListener,
    manager: Arc<ClientManager>,
    host: String,
    port: u16,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            manager.clone(),
                            host.clone(),
                            port,
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "control socket accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    manager: Arc<ClientManager>,
    host: String,
    port: u16,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, EventCodec::default());
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = framed.next() => match frame {
                None => return,
                Some(Err(e)) => {
                    debug!(error = %e, "control request decode failed");
                    return;
                }
                Some(Ok(envelope)) => envelope,
            },
        };

        let response = match request.event {
            Event::Control(control) => handle_request(&manager, &host, port, control).await,
            _ => bad_request("control socket accepts control requests only"),
        };

        let reply = Envelope::from_server(Event::Control(response));
        if let Err(e) = framed.send(reply).await {
            debug!(error = %e, "control response send failed");
            return;
        }
    }
}

async fn handle_request(
    manager: &Arc<ClientManager>,
    host: &str,
    port: u16,
    request: ControlEvent,
) -> ControlEvent {
    match request {
        ControlEvent::Status => {
            ControlEvent::StatusResponse(manager.status_report(host, port).await)
        }
        ControlEvent::Release => {
            manager.switch_to_local().await;
            ControlEvent::Ack
        }
        ControlEvent::Connect { slot } => routing_reply(manager.connect_slot(slot as usize).await),
        ControlEvent::SwitchAction(action) => match action {
            SwitchAction::Next => routing_reply(manager.switch_to_next().await),
            SwitchAction::Prev => routing_reply(manager.switch_to_prev().await),
            // Legacy toggle names.
            SwitchAction::Enable => routing_reply(manager.connect_slot(1).await),
            SwitchAction::Disable => {
                manager.switch_to_local().await;
                ControlEvent::Ack
            }
        },
        other => bad_request(&format!("unsupported request: {other:?}")),
    }
}

fn routing_reply(result: Result<(), crate::manager::RoutingError>) -> ControlEvent {
    match result {
        Ok(()) => ControlEvent::Ack,
        Err(e) => ControlEvent::Err {
            kind: e.kind().to_string(),
            message: e.to_string(),
        },
    }
}

fn bad_request(message: &str) -> ControlEvent {
    ControlEvent::Err {
        kind: "bad-request".to_string(),
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Helper (CLI) side
// ---------------------------------------------------------------------------

/// Send one request to the server's control socket and return its answer.
pub async fn request(path: &PathBuf, request: ControlEvent) -> Result<ControlEvent, ControlError> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|_| ControlError::NotRunning { path: path.clone() })?;
    let mut framed = Framed::new(stream, EventCodec::default());

    framed
        .send(Envelope {
            source: "cli".to_string(),
            event: Event::Control(request),
        })
        .await?;

    match framed.next().await {
        None => Err(ControlError::UnexpectedResponse(
            "connection closed before response".into(),
        )),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(envelope)) => match envelope.event {
            Event::Control(response) => Ok(response),
            other => Err(ControlError::UnexpectedResponse(format!("{other:?}"))),
        },
    }
}
