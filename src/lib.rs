//! # waylink
//!
//! Network-transparent input relay for Linux Wayland workstations: one
//! machine's physical keyboard and mouse, redirected on demand into the
//! graphical session of another.
//!
//! # Architecture
//!
//! ```text
//! server                                        client
//!   capture (evdev grab) ─▶ routing core ─▶ transport ══ TCP ══ transport ─▶ injector
//!         ▲                    ▲    ▲                                        (virtual
//!         │ hotkey chords      │    │                                         pointer +
//!         └────────────────────┘    ├── control socket (CLI helpers)          keyboard)
//!                                   └── emergency triggers
//! ```
//!
//! # Data Flow
//!
//! **Input path:** kernel device → capture → routing core → session queue
//! → framed TCP → client receive loop → virtual devices.
//!
//! **Control plane:** hotkeys, the Unix control socket and the emergency
//! triggers all drive the routing core; the routing core alone decides
//! where input goes and when devices are grabbed.
//!
//! # Threading Model
//!
//! Tokio throughout: one task per captured device, one per accepted
//! session (plus its writer), one per emergency trigger, one relay loop.
//! Cancellation is explicit via cancellation tokens; every task observes
//! the process-wide shutdown token or a child of it.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Device capture: enumeration, exclusive grabs, canonical event stream.
pub mod capture;

/// Client process lifecycle: reconnect loop and receive path.
pub mod client;

/// Configuration loading and validation.
pub mod config;

/// Local Unix-socket control service and its request helper.
pub mod control;

/// Out-of-band release triggers (signal, inactivity, marker file).
pub mod emergency;

/// Hotkey chord detection on the captured key stream.
pub mod hotkeys;

/// Virtual-input injection into the client's Wayland session.
pub mod inject;

/// The routing core: connected clients and the active target.
pub mod manager;

/// Monitor-topology discovery behind one trait.
pub mod monitors;

/// Canonical events and the framed wire codec.
pub mod protocol;

/// Server process lifecycle and the relay loop.
pub mod server;

/// Authenticated TCP transport between server and clients.
pub mod transport;
