//! Secure Transport
//!
//! Authenticated TCP channel between the server and its clients. The
//! server binds one listener and runs one session task per accepted
//! connection (see [`session`]); the client side resolves, connects with a
//! deadline, authenticates, and hands back a framed connection ready for
//! event traffic.
//!
//! Authentication is SSH-style public-key (see [`auth`]); client identity
//! screening goes through the [`trust`] store. All post-handshake traffic
//! is the event codec over length-prefixed frames.

pub mod auth;
pub mod keys;
mod session;
pub mod trust;

pub use auth::{ApprovalOutcome, ApprovalPrompt, AuthError, HandshakeStatus, PeerClaim, StdinPrompt};
pub use keys::{KeyError, UserKey};
pub use trust::{TrustPolicy, TrustStore};

use ssh_key::{PrivateKey, PublicKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::ClientManager;
use crate::protocol::{EventCodec, FrameCodec, ProtocolError};

/// Deadline for establishing the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// A session with no inbound traffic for this long is dead.
pub const DEAD_AFTER: Duration = Duration::from_secs(15);

/// Deadline for the client's configuration frame after authentication.
pub const CONFIG_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound queue depth per session; senders wait when it fills.
pub const OUTBOUND_QUEUE: usize = 256;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listener could not bind. An in-use port gets its own exit code.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Name resolution produced no usable address.
    #[error("cannot resolve {host}: {reason}")]
    Resolve {
        /// The configured host.
        host: String,
        /// What went wrong.
        reason: String,
    },

    /// The TCP connect did not finish inside [`CONNECT_TIMEOUT`].
    #[error("connecting to {addr} timed out")]
    ConnectTimeout {
        /// Target address.
        addr: String,
    },

    /// The TCP connect failed outright.
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        /// Target address.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Authentication failed or was denied.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A frame could not be decoded; the session closes.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The required configuration frame never arrived.
    #[error("client did not send its configuration")]
    MissingClientConfig,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// Keepalive loss: nothing inbound for the stated duration.
    #[error("peer unresponsive for {0:?}")]
    Dead(Duration),

    /// Any other socket failure.
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Server listener
// ---------------------------------------------------------------------------

/// The listening side: accepts connections and spawns session tasks.
pub struct TransportServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl TransportServer {
    /// Bind the listener and start accepting.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        listen_host: &str,
        port: u16,
        host_key: PrivateKey,
        trust: Arc<TrustStore>,
        prompt: Arc<dyn ApprovalPrompt>,
        manager: Arc<ClientManager>,
        max_frame: usize,
        shutdown: &CancellationToken,
    ) -> Result<Self, TransportError> {
        let addr = format!("{listen_host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;
        info!(%local_addr, "listening for clients");

        let cancel = shutdown.child_token();
        let context = Arc::new(session::SessionContext {
            manager,
            host_key: Arc::new(host_key),
            trust,
            prompt,
            max_frame,
        });

        let accept_task = tokio::spawn(accept_loop(listener, context, cancel.clone()));

        Ok(Self {
            local_addr,
            accept_task,
            cancel,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener and cancel all running sessions.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
        info!("transport listener stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<session::SessionContext>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "set_nodelay failed");
                        }
                        tokio::spawn(session::run_session(
                            stream,
                            addr,
                            context.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        // Transient failure (fd pressure); do not spin.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client connector
// ---------------------------------------------------------------------------

/// An authenticated, event-framed connection to the server.
pub struct ClientConnection {
    /// The framed stream, ready for event traffic. The first frame the
    /// caller sends must be its configuration.
    pub framed: Framed<TcpStream, EventCodec>,
    /// The server's verified host key.
    pub server_key: PublicKey,
    /// The address we connected to.
    pub addr: SocketAddr,
}

/// Resolve, connect, and authenticate to the server.
pub async fn connect_client(
    host: &str,
    port: u16,
    user_key: &UserKey,
    max_frame: usize,
    on_status: impl FnMut(HandshakeStatus),
) -> Result<ClientConnection, TransportError> {
    let target = format!("{host}:{port}");

    let mut addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| TransportError::Resolve {
            host: target.clone(),
            reason: e.to_string(),
        })?;
    let addr = addrs.next().ok_or_else(|| TransportError::Resolve {
        host: target.clone(),
        reason: "no addresses".into(),
    })?;

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Err(_) => return Err(TransportError::ConnectTimeout { addr: target.clone() }),
        Ok(Err(source)) => {
            return Err(TransportError::Connect {
                addr: target.clone(),
                source,
            })
        }
        Ok(Ok(stream)) => stream,
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    debug!(%addr, "connected, authenticating");

    let mut framed = Framed::new(stream, FrameCodec::new(max_frame));
    let server_key = auth::client_handshake(&mut framed, user_key, on_status).await?;

    let framed = framed.map_codec(|_| EventCodec::with_max_frame(max_frame));
    Ok(ClientConnection {
        framed,
        server_key,
        addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ActiveTarget, LogNotifier};
    use crate::protocol::{capabilities, ClientConfig, ControlEvent, Envelope, Event};
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use rand_core::OsRng;
    use ssh_key::Algorithm;

    struct AutoApprove;

    #[async_trait]
    impl ApprovalPrompt for AutoApprove {
        async fn request(&self, _peer: &PeerClaim) -> ApprovalOutcome {
            ApprovalOutcome::Approved
        }
    }

    fn test_key() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
    }

    async fn start_server(
        manager: Arc<ClientManager>,
        dir: &tempfile::TempDir,
    ) -> (TransportServer, CancellationToken) {
        let trust = Arc::new(
            TrustStore::load(&dir.path().join("known_clients"), TrustPolicy::Open).unwrap(),
        );
        let shutdown = CancellationToken::new();
        let server = TransportServer::bind(
            "127.0.0.1",
            0,
            test_key(),
            trust,
            Arc::new(AutoApprove),
            manager,
            crate::protocol::DEFAULT_MAX_FRAME,
            &shutdown,
        )
        .await
        .unwrap();
        (server, shutdown)
    }

    fn config_frame(id: &str, name: &str) -> Envelope {
        Envelope {
            source: id.to_string(),
            event: Event::Control(ControlEvent::ClientConfig(ClientConfig {
                id: id.into(),
                name: name.into(),
                monitors: vec![],
                capabilities: capabilities::POINTER | capabilities::KEYBOARD,
            })),
        }
    }

    #[tokio::test]
    async fn client_registers_and_receives_relayed_input() {
        let manager = ClientManager::new(Arc::new(LogNotifier), Duration::from_millis(100));
        let dir = tempfile::tempdir().unwrap();
        let (server, _shutdown) = start_server(manager.clone(), &dir).await;
        let port = server.local_addr().port();

        let user_key = UserKey::File(Box::new(test_key()));
        let mut connection = connect_client(
            "127.0.0.1",
            port,
            &user_key,
            crate::protocol::DEFAULT_MAX_FRAME,
            |_| {},
        )
        .await
        .unwrap();

        connection
            .framed
            .send(config_frame("laptop", "laptop.lan"))
            .await
            .unwrap();

        // Wait for registration to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.client_count().await == 0 {
            assert!(tokio::time::Instant::now() < deadline, "never registered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Switch to slot 1 and relay a key.
        manager.connect_slot(1).await.unwrap();
        manager
            .handle_input_event(Event::Key {
                code: 30,
                pressed: true,
                timestamp_us: 1,
            })
            .await;

        // The client sees RequestControl then the key, in order.
        let mut saw_request = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "frames never arrived");
            match tokio::time::timeout(Duration::from_secs(1), connection.framed.next()).await {
                Ok(Some(Ok(envelope))) => match envelope.event {
                    Event::Control(ControlEvent::RequestControl) => saw_request = true,
                    Event::Key { code: 30, .. } => {
                        assert!(saw_request, "key arrived before RequestControl");
                        break;
                    }
                    Event::Control(ControlEvent::Ping { .. }) => {}
                    other => panic!("unexpected frame {other:?}"),
                },
                other => panic!("stream ended early: {other:?}"),
            }
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn disconnect_of_active_client_surrenders_control() {
        let manager = ClientManager::new(Arc::new(LogNotifier), Duration::from_millis(100));
        let dir = tempfile::tempdir().unwrap();
        let (server, _shutdown) = start_server(manager.clone(), &dir).await;
        let port = server.local_addr().port();

        let user_key = UserKey::File(Box::new(test_key()));
        let mut connection = connect_client(
            "127.0.0.1",
            port,
            &user_key,
            crate::protocol::DEFAULT_MAX_FRAME,
            |_| {},
        )
        .await
        .unwrap();
        connection
            .framed
            .send(config_frame("laptop", "laptop.lan"))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.client_count().await == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.connect_slot(1).await.unwrap();

        // Hard disconnect.
        drop(connection);

        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        loop {
            if manager.active_target().await == ActiveTarget::Local
                && manager.client_count().await == 0
            {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "control not surrendered within 500ms"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn session_without_config_frame_is_dropped() {
        let manager = ClientManager::new(Arc::new(LogNotifier), Duration::from_millis(100));
        let dir = tempfile::tempdir().unwrap();
        let (server, _shutdown) = start_server(manager.clone(), &dir).await;
        let port = server.local_addr().port();

        let user_key = UserKey::File(Box::new(test_key()));
        let mut connection = connect_client(
            "127.0.0.1",
            port,
            &user_key,
            crate::protocol::DEFAULT_MAX_FRAME,
            |_| {},
        )
        .await
        .unwrap();

        // Send input instead of the required configuration.
        connection
            .framed
            .send(Envelope {
                source: "laptop".into(),
                event: Event::Key {
                    code: 30,
                    pressed: true,
                    timestamp_us: 0,
                },
            })
            .await
            .unwrap();

        // The server closes; our next read reports end of stream (skipping
        // any frames that raced in).
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "session never closed");
            match tokio::time::timeout(Duration::from_secs(1), connection.framed.next()).await {
                Ok(None) => break,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => break,
                Err(_) => continue,
            }
        }
        assert_eq!(manager.client_count().await, 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let manager = ClientManager::new(Arc::new(LogNotifier), Duration::from_millis(100));
        let dir = tempfile::tempdir().unwrap();
        let (server, shutdown) = start_server(manager.clone(), &dir).await;
        let port = server.local_addr().port();

        let trust = Arc::new(
            TrustStore::load(&dir.path().join("kc2"), TrustPolicy::Open).unwrap(),
        );
        match TransportServer::bind(
            "127.0.0.1",
            port,
            test_key(),
            trust,
            Arc::new(AutoApprove),
            manager,
            crate::protocol::DEFAULT_MAX_FRAME,
            &shutdown,
        )
        .await
        {
            Err(TransportError::Bind { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
            }
            other => panic!("expected Bind error, got {:?}", other.map(|s| s.local_addr())),
        }

        server.stop().await;
    }
}
