//! Routing Core
//!
//! Single authoritative owner of "who currently receives input". Every
//! routing mutation — hotkey, control socket, emergency release, client
//! disconnect, shutdown — funnels through [`ClientManager`], which keeps
//! the connected-client set and the active target consistent under one
//! writer lock.
//!
//! # Lock Discipline
//!
//! One `RwLock` guards all mutable state. Mutations take the write lock;
//! read-only queries take the read lock. No operation holds the lock
//! across a network send: outbound messages are collected as
//! (send-handle, envelope) pairs under the lock and dispatched after it is
//! released. Device grab/ungrab is a watch-channel store, not I/O, and is
//! flipped inside the critical section so routing state and grab wishes
//! never diverge.
//!
//! # Ordering
//!
//! Events reach the active client in capture order because each session
//! has exactly one FIFO send queue and this module enqueues from a single
//! dispatch path. A switch changes which queue subsequent events land in;
//! events already queued for the previous target stay there.

mod activity;

pub use activity::ActivityThrottle;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::protocol::{
    ClientSummary, ControlEvent, Envelope, Event, LogLevel, Monitor, StatusReport,
};

/// Server-assigned client identifier, unique for the process lifetime.
pub type ClientId = u64;

/// How long `SwitchToClient` stays refused after an emergency release.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);

/// Grace period for the shutdown broadcast to drain.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Destination of captured input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTarget {
    /// Input stays with the local session.
    Local,
    /// Input is relayed to this client.
    Client(ClientId),
}

/// Why control was forced back to local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Release signal delivered to the process.
    Signal,
    /// No input for the configured inactivity window.
    Inactivity,
    /// The marker file appeared.
    MarkerFile,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Inactivity => write!(f, "inactivity"),
            Self::MarkerFile => write!(f, "marker-file"),
        }
    }
}

/// Routing failures, reported to whichever caller asked for the switch.
/// Routing state is unchanged when one of these comes back.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The requested client id is not registered.
    #[error("no such client: {0}")]
    UnknownTarget(ClientId),

    /// The requested slot has no registered client.
    #[error("no client in slot {0}")]
    NoSuchSlot(usize),

    /// An emergency release happened moments ago.
    #[error("switching is in emergency cooldown for another {remaining_ms} ms")]
    Cooldown {
        /// Milliseconds until switching is allowed again.
        remaining_ms: u64,
    },

    /// Rotation was requested with an empty client set.
    #[error("no clients connected")]
    NoClients,
}

impl RoutingError {
    /// Machine-readable kind for control-socket error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTarget(_) => "unknown-target",
            Self::NoSuchSlot(_) => "no-such-slot",
            Self::Cooldown { .. } => "cooldown",
            Self::NoClients => "no-clients",
        }
    }
}

/// Thin send handle into one session's outbound FIFO queue.
///
/// The manager holds one per registered client; the queue itself and the
/// task draining it belong to the session. Enqueueing applies
/// backpressure: a full queue makes the caller wait, it never reorders.
#[derive(Clone)]
pub struct SessionSender {
    tx: mpsc::Sender<Envelope>,
}

impl SessionSender {
    /// Wrap a session's outbound queue.
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Enqueue one envelope; fails when the session is gone.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), ()> {
        self.tx.send(envelope).await.map_err(|_| ())
    }

    /// Whether two handles point at the same session queue.
    pub fn same_session(&self, other: &SessionSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Operator-facing notifications. The terminal front-end logs them; a
/// richer UI would render them.
pub trait UiNotifier: Send + Sync {
    /// The active target changed.
    fn target_changed(&self, target: &ActiveTarget, name: Option<&str>);
    /// Input flowed to a remote client (coalesced, see [`ActivityThrottle`]).
    fn input_activity(&self, recent_events: u32);
    /// A failure the operator should see.
    fn surface_error(&self, kind: &str, message: &str);
}

/// Default notifier: structured log lines.
pub struct LogNotifier;

impl UiNotifier for LogNotifier {
    fn target_changed(&self, target: &ActiveTarget, name: Option<&str>) {
        match target {
            ActiveTarget::Local => info!("input now stays local"),
            ActiveTarget::Client(id) => {
                info!(client = *id, name = name.unwrap_or("?"), "input now relayed")
            }
        }
    }

    fn input_activity(&self, recent_events: u32) {
        debug!(recent_events, "relaying input");
    }

    fn surface_error(&self, kind: &str, message: &str) {
        warn!(kind, message, "operator-visible failure");
    }
}

/// Connection-time facts about a client, as the transport hands them over.
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// Client-declared stable id.
    pub declared_id: String,
    /// Display name.
    pub name: String,
    /// Remote address.
    pub addr: SocketAddr,
    /// Declared monitor layout.
    pub monitors: Vec<Monitor>,
    /// Declared capability bits.
    pub capabilities: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    BeingControlled,
}

struct ClientRecord {
    id: ClientId,
    declared_id: String,
    name: String,
    addr: SocketAddr,
    connected_at: Instant,
    state: ClientState,
    monitors: Vec<Monitor>,
    capabilities: u32,
    sender: SessionSender,
}

struct ManagerState {
    /// Registration order matters: it defines slots.
    clients: Vec<ClientRecord>,
    active: ActiveTarget,
    /// Redundant view of `active == Local`; kept in lockstep.
    locally_controlling: bool,
    last_input_activity: Instant,
    cooldown_until: Option<Instant>,
    next_id: ClientId,
    activity: ActivityThrottle,
}

impl ManagerState {
    fn set_active(&mut self, target: ActiveTarget) {
        self.active = target;
        self.locally_controlling = target == ActiveTarget::Local;
    }

    fn record(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.id == id)
    }

    fn record_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    fn active_position(&self) -> Option<usize> {
        match self.active {
            ActiveTarget::Local => None,
            ActiveTarget::Client(id) => self.clients.iter().position(|c| c.id == id),
        }
    }

    fn cooldown_remaining(&self) -> Option<Duration> {
        self.cooldown_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }
}

/// The routing core. One per server process, shared as `Arc`.
pub struct ClientManager {
    state: RwLock<ManagerState>,
    /// True while devices should be exclusively grabbed.
    grab_wish: watch::Sender<bool>,
    notifier: Arc<dyn UiNotifier>,
    cooldown: Duration,
}

impl ClientManager {
    /// New manager with no clients, input local, devices released.
    pub fn new(notifier: Arc<dyn UiNotifier>, cooldown: Duration) -> Arc<Self> {
        let (grab_wish, _) = watch::channel(false);
        Arc::new(Self {
            state: RwLock::new(ManagerState {
                clients: Vec::new(),
                active: ActiveTarget::Local,
                locally_controlling: true,
                last_input_activity: Instant::now(),
                cooldown_until: None,
                next_id: 1,
                activity: ActivityThrottle::new(),
            }),
            grab_wish,
            notifier,
            cooldown,
        })
    }

    /// Subscribe to the grab wish; the capture layer applies it.
    pub fn grab_signal(&self) -> watch::Receiver<bool> {
        self.grab_wish.subscribe()
    }

    // -- registration -----------------------------------------------------

    /// Add a client to the registered set and return its id. Re-announcing
    /// an already-registered declared id refreshes the record instead of
    /// duplicating it.
    pub async fn register_client(&self, hello: ClientHello, sender: SessionSender) -> ClientId {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .clients
            .iter_mut()
            .find(|c| c.declared_id == hello.declared_id)
        {
            existing.name = hello.name;
            existing.addr = hello.addr;
            existing.monitors = hello.monitors;
            existing.capabilities = hello.capabilities;
            existing.sender = sender;
            debug!(client = existing.id, "client re-registered");
            return existing.id;
        }

        let id = state.next_id;
        state.next_id += 1;
        info!(client = id, name = %hello.name, addr = %hello.addr, "client registered");
        state.clients.push(ClientRecord {
            id,
            declared_id: hello.declared_id,
            name: hello.name,
            addr: hello.addr,
            connected_at: Instant::now(),
            state: ClientState::Idle,
            monitors: hello.monitors,
            capabilities: hello.capabilities,
            sender,
        });
        id
    }

    /// Remove a client. If it was the active target, control returns to
    /// local (devices ungrabbed) and a release is queued to whatever is
    /// left of its session.
    pub async fn unregister_client(&self, id: ClientId) {
        self.unregister_inner(id, None).await
    }

    /// Session-owned removal: takes effect only while the record still
    /// belongs to the calling session. A record refreshed by a reconnect
    /// under the same declared id stays put when the superseded session
    /// finally tears down.
    pub async fn unregister_session(&self, id: ClientId, sender: &SessionSender) {
        self.unregister_inner(id, Some(sender)).await
    }

    async fn unregister_inner(&self, id: ClientId, owner: Option<&SessionSender>) {
        let mut outbox = Vec::new();
        {
            let mut state = self.state.write().await;
            let Some(position) = state.clients.iter().position(|c| c.id == id) else {
                return;
            };
            if let Some(owner) = owner {
                if !state.clients[position].sender.same_session(owner) {
                    debug!(client = id, "record superseded by a newer session, keeping it");
                    return;
                }
            }

            let was_active = state.active == ActiveTarget::Client(id);
            let record = state.clients.remove(position);
            info!(client = id, name = %record.name, "client unregistered");

            if was_active {
                outbox.push((
                    record.sender.clone(),
                    Envelope::from_server(Event::Control(ControlEvent::ReleaseControl)),
                ));
                state.set_active(ActiveTarget::Local);
                self.grab_wish.send_replace(false);
                self.notifier.target_changed(&ActiveTarget::Local, None);
            }
        }
        self.flush_outbox(outbox).await;
    }

    // -- switching --------------------------------------------------------

    /// Route input to a registered client.
    pub async fn switch_to_client(&self, id: ClientId) -> Result<(), RoutingError> {
        let mut outbox = Vec::new();
        {
            let mut state = self.state.write().await;

            if let Some(remaining) = state.cooldown_remaining() {
                return Err(RoutingError::Cooldown {
                    remaining_ms: remaining.as_millis() as u64,
                });
            }
            if state.record(id).is_none() {
                return Err(RoutingError::UnknownTarget(id));
            }
            if state.active == ActiveTarget::Client(id) {
                return Ok(());
            }

            // Tell the previous target to let go first.
            if let ActiveTarget::Client(previous) = state.active {
                if let Some(record) = state.record_mut(previous) {
                    record.state = ClientState::Idle;
                    outbox.push((
                        record.sender.clone(),
                        Envelope::from_server(Event::Control(ControlEvent::ReleaseControl)),
                    ));
                }
            }

            let name = {
                let record = state.record_mut(id).expect("checked above");
                record.state = ClientState::BeingControlled;
                outbox.push((
                    record.sender.clone(),
                    Envelope::from_server(Event::Control(ControlEvent::RequestControl)),
                ));
                record.name.clone()
            };

            state.set_active(ActiveTarget::Client(id));
            state.last_input_activity = Instant::now();
            self.grab_wish.send_replace(true);
            self.notifier
                .target_changed(&ActiveTarget::Client(id), Some(&name));
        }
        self.flush_outbox(outbox).await;
        Ok(())
    }

    /// Route input back to the local session.
    pub async fn switch_to_local(&self) {
        let mut outbox = Vec::new();
        {
            let mut state = self.state.write().await;
            if state.active == ActiveTarget::Local {
                return;
            }
            if let ActiveTarget::Client(id) = state.active {
                if let Some(record) = state.record_mut(id) {
                    record.state = ClientState::Idle;
                    outbox.push((
                        record.sender.clone(),
                        Envelope::from_server(Event::Control(ControlEvent::ReleaseControl)),
                    ));
                }
            }
            state.set_active(ActiveTarget::Local);
            self.grab_wish.send_replace(false);
            self.notifier.target_changed(&ActiveTarget::Local, None);
        }
        self.flush_outbox(outbox).await;
    }

    /// Rotate to the next client in registration order. With no clients
    /// this behaves like a switch to local.
    pub async fn switch_to_next(&self) -> Result<(), RoutingError> {
        self.rotate(1).await
    }

    /// Rotate to the previous client in registration order.
    pub async fn switch_to_prev(&self) -> Result<(), RoutingError> {
        self.rotate(-1).await
    }

    async fn rotate(&self, direction: isize) -> Result<(), RoutingError> {
        let next = {
            let state = self.state.read().await;
            if state.clients.is_empty() {
                None
            } else {
                let len = state.clients.len() as isize;
                let position = match state.active_position() {
                    // From local, "next" is the first slot and "prev" the
                    // last.
                    None => {
                        if direction > 0 {
                            0
                        } else {
                            len - 1
                        }
                    }
                    Some(current) => (current as isize + direction).rem_euclid(len),
                };
                Some(state.clients[position as usize].id)
            }
        };
        match next {
            Some(id) => self.switch_to_client(id).await,
            None => {
                self.switch_to_local().await;
                Ok(())
            }
        }
    }

    /// Switch by 1-based registration-order slot.
    pub async fn connect_slot(&self, slot: usize) -> Result<(), RoutingError> {
        if slot == 0 {
            return Err(RoutingError::NoSuchSlot(slot));
        }
        let id = {
            let state = self.state.read().await;
            state
                .clients
                .get(slot - 1)
                .map(|record| record.id)
                .ok_or(RoutingError::NoSuchSlot(slot))?
        };
        self.switch_to_client(id).await
    }

    // -- event paths ------------------------------------------------------

    /// Dispatch one captured input event to the active target. Dropped
    /// when input is local.
    pub async fn handle_input_event(&self, event: Event) {
        debug_assert!(event.is_input());
        let send = {
            let mut state = self.state.write().await;
            state.last_input_activity = Instant::now();

            match state.active {
                ActiveTarget::Local => None,
                ActiveTarget::Client(id) => {
                    let pulse = state.activity.tick();
                    let sender = state.record(id).map(|record| record.sender.clone());
                    if let Some(count) = pulse {
                        self.notifier.input_activity(count);
                    }
                    sender
                }
            }
        };

        if let Some(sender) = send {
            if sender.enqueue(Envelope::from_server(event)).await.is_err() {
                debug!("dropping event for departing client");
            }
        }
    }

    /// Process a control event that arrived from a client session.
    pub async fn handle_control_event(&self, source: ClientId, event: ControlEvent) {
        match event {
            ControlEvent::ClientConfig(config) => {
                let mut state = self.state.write().await;
                if let Some(record) = state.record_mut(source) {
                    debug!(
                        client = source,
                        monitors = config.monitors.len(),
                        "client configuration updated"
                    );
                    record.name = config.name;
                    record.monitors = config.monitors;
                    record.capabilities = config.capabilities;
                }
            }
            // Switches are operator-driven; a client may ask, the answer
            // is a log line.
            ControlEvent::RequestControl => {
                info!(client = source, "client requested control (ignored)")
            }
            ControlEvent::ReleaseControl => {
                info!(client = source, "client announced release (ignored)")
            }
            ControlEvent::Log { level, message } => match level {
                LogLevel::Error => warn!(client = source, message, "client log"),
                LogLevel::Warn => warn!(client = source, message, "client log"),
                LogLevel::Info => info!(client = source, message, "client log"),
                LogLevel::Debug => debug!(client = source, message, "client log"),
            },
            other => {
                debug!(client = source, event = ?other, "ignoring control event");
            }
        }
    }

    // -- emergency & shutdown ---------------------------------------------

    /// Force input back to local and start the switch cooldown.
    pub async fn emergency_release(&self, reason: ReleaseReason) {
        warn!(%reason, "emergency release");
        {
            let mut state = self.state.write().await;
            state.cooldown_until = Some(Instant::now() + self.cooldown);
        }
        self.switch_to_local().await;
        self.notifier
            .surface_error("emergency-release", &reason.to_string());
    }

    /// Broadcast the shutdown notice to every registered client and allow
    /// the session queues a short grace period to drain.
    pub async fn notify_shutdown(&self) {
        let outbox: Vec<_> = {
            let state = self.state.read().await;
            state
                .clients
                .iter()
                .map(|record| {
                    (
                        record.sender.clone(),
                        Envelope::from_server(Event::Control(ControlEvent::ServerShutdown)),
                    )
                })
                .collect()
        };
        let had_clients = !outbox.is_empty();
        self.flush_outbox(outbox).await;
        if had_clients {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    // -- queries ----------------------------------------------------------

    /// Current destination of captured input.
    pub async fn active_target(&self) -> ActiveTarget {
        self.state.read().await.active
    }

    /// Whether input currently stays local.
    pub async fn is_controlling_local(&self) -> bool {
        let state = self.state.read().await;
        debug_assert_eq!(
            state.locally_controlling,
            state.active == ActiveTarget::Local
        );
        state.locally_controlling
    }

    /// Time since the last captured input event.
    pub async fn last_activity_age(&self) -> Duration {
        self.state.read().await.last_input_activity.elapsed()
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    /// Status snapshot for the control socket.
    pub async fn status_report(&self, host: &str, port: u16) -> StatusReport {
        let state = self.state.read().await;
        let active_slot = state
            .active_position()
            .map(|position| position as u32 + 1)
            .unwrap_or(0);
        StatusReport {
            host: host.to_string(),
            port,
            active_slot,
            clients: state
                .clients
                .iter()
                .map(|record| ClientSummary {
                    name: record.name.clone(),
                    addr: record.addr.to_string(),
                    connected_secs: record.connected_at.elapsed().as_secs(),
                    controlled: record.state == ClientState::BeingControlled,
                })
                .collect(),
        }
    }

    async fn flush_outbox(&self, outbox: Vec<(SessionSender, Envelope)>) {
        for (sender, envelope) in outbox {
            if sender.enqueue(envelope).await.is_err() {
                debug!("control message dropped: session already gone");
            }
        }
    }
}
