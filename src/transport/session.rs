//! Server-Side Session
//!
//! One task per accepted client, owning the socket for the session's
//! lifetime. Three concurrent flows share it:
//!
//! - **inbound** — decode frames, answer pings, hand control events to the
//!   routing core;
//! - **outbound** — a dedicated writer task draining the session's FIFO
//!   queue into the socket (the queue's send handle is what the routing
//!   core holds);
//! - **keepalive** — periodic pings, with the session declared dead when
//!   nothing has arrived for the loss window.
//!
//! Registration happens only after the client's configuration frame: a
//! client is in the registered set exactly while its session runs. Any
//! exit path unregisters first (surrendering control to local if this
//! client was active), then lets the writer drain so a queued shutdown or
//! release notice still reaches the peer.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::auth::{self, ApprovalPrompt};
use super::trust::TrustStore;
use super::{
    TransportError, CONFIG_DEADLINE, DEAD_AFTER, OUTBOUND_QUEUE, PING_INTERVAL,
};
use crate::manager::{ClientHello, ClientManager, SessionSender};
use crate::protocol::{
    ControlEvent, Envelope, Event, EventCodec, FrameCodec,
};
use ssh_key::PrivateKey;

/// Shared dependencies of every server session.
pub(super) struct SessionContext {
    pub manager: Arc<ClientManager>,
    pub host_key: Arc<PrivateKey>,
    pub trust: Arc<TrustStore>,
    pub prompt: Arc<dyn ApprovalPrompt>,
    pub max_frame: usize,
}

/// Drive one accepted connection to completion.
pub(super) async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    if let Err(e) = session_inner(stream, addr, ctx, cancel).await {
        match e {
            TransportError::Auth(auth_error) => {
                // Denials and timeouts are operational events, not bugs.
                warn!(%addr, error = %auth_error, "authentication failed");
            }
            other => {
                info!(%addr, error = %other, "session ended with error");
            }
        }
    }
}

async fn session_inner(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    // Phase 1: authenticate over raw frames.
    let mut framed = Framed::new(stream, FrameCodec::new(ctx.max_frame));
    let peer = auth::server_handshake(
        &mut framed,
        &ctx.host_key,
        &ctx.trust,
        ctx.prompt.as_ref(),
        addr,
    )
    .await?;

    // Phase 2: switch to the event codec; the buffered remainder carries
    // over.
    let max_frame = ctx.max_frame;
    let mut framed = framed.map_codec(|_| EventCodec::with_max_frame(max_frame));

    // The first event frame must be the client's configuration.
    let config = match tokio::time::timeout(CONFIG_DEADLINE, framed.next()).await {
        Err(_) | Ok(None) => return Err(TransportError::MissingClientConfig),
        Ok(Some(envelope)) => match envelope?.event {
            Event::Control(ControlEvent::ClientConfig(config)) => config,
            _ => return Err(TransportError::MissingClientConfig),
        },
    };

    let declared_id = if config.id.is_empty() {
        peer.fingerprint.clone()
    } else {
        config.id.clone()
    };

    let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let session_sender = SessionSender::new(outbound_tx.clone());
    let client_id = ctx
        .manager
        .register_client(
            ClientHello {
                declared_id,
                name: config.name.clone(),
                addr,
                monitors: config.monitors.clone(),
                capabilities: config.capabilities,
            },
            session_sender.clone(),
        )
        .await;

    info!(%addr, client = client_id, name = %config.name, "session established");

    let (sink, mut inbound) = framed.split();
    let writer = tokio::spawn(writer_task(sink, outbound_rx));

    let mut ping_seq: u64 = 0;
    let mut last_inbound = Instant::now();
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(client = client_id, "session cancelled");
                break Ok(());
            }

            _ = ping_ticker.tick() => {
                if last_inbound.elapsed() > DEAD_AFTER {
                    break Err(TransportError::Dead(last_inbound.elapsed()));
                }
                ping_seq += 1;
                let ping = Envelope::from_server(Event::Control(ControlEvent::Ping {
                    seq: ping_seq,
                }));
                if outbound_tx.send(ping).await.is_err() {
                    break Err(TransportError::Closed);
                }
            }

            frame = inbound.next() => {
                match frame {
                    None => break Err(TransportError::Closed),
                    Some(Err(e)) => break Err(TransportError::Protocol(e)),
                    Some(Ok(envelope)) => {
                        last_inbound = Instant::now();
                        handle_inbound(&ctx.manager, client_id, &outbound_tx, envelope).await;
                    }
                }
            }
        }
    };

    // Teardown: remove from the registered set (surrendering control if
    // this client was active), then let the writer drain what is queued.
    // Removal is keyed to this session's queue so a reconnect that took
    // over the record survives the old session's exit.
    ctx.manager.unregister_session(client_id, &session_sender).await;
    drop(outbound_tx);
    let _ = writer.await;

    info!(client = client_id, "session closed");
    result
}

async fn handle_inbound(
    manager: &Arc<ClientManager>,
    client_id: u64,
    outbound: &mpsc::Sender<Envelope>,
    envelope: Envelope,
) {
    match envelope.event {
        Event::Control(ControlEvent::Ping { seq }) => {
            let pong = Envelope::from_server(Event::Control(ControlEvent::Pong { seq }));
            let _ = outbound.send(pong).await;
        }
        Event::Control(ControlEvent::Pong { .. }) => {}
        Event::Control(control) => {
            manager.handle_control_event(client_id, control).await;
        }
        // Clients do not send input to the server.
        other => {
            trace!(client = client_id, event = ?other, "ignoring inbound input event");
        }
    }
}

/// Drain the outbound queue into the socket, FIFO. Ends when the queue
/// closes (all send handles dropped) or the socket fails; always drains
/// buffered messages before closing so shutdown and release notices get
/// out.
async fn writer_task(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, EventCodec>, Envelope>,
    mut outbound: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = sink.send(envelope).await {
            debug!(error = %e, "outbound send failed");
            return;
        }
    }
    let _ = sink.close().await;
}
