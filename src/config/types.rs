//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server-role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (host or host:port; a bare host uses `port`)
    pub listen_addr: String,

    /// TCP port for client sessions
    pub port: u16,

    /// Path to the server's SSH host key (generated on first run)
    pub host_key_path: PathBuf,

    /// Path to the trust store (one accepted fingerprint per line)
    pub trust_store_path: PathBuf,

    /// Trust policy: "open" allows interactive approval of unknown keys,
    /// "strict" accepts only fingerprints already in the store
    pub trust_policy: String,

    /// Maximum accepted frame size in bytes
    pub max_frame_size: usize,
}

/// Client-role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server to connect to, "host:port"
    pub server_addr: Option<String>,

    /// Path to the user private key; empty = agent, then default location
    pub user_key_path: Option<PathBuf>,

    /// Display name announced to the server (default: hostname)
    pub name: Option<String>,
}

/// Device capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Explicitly selected devices by stable identifier; empty = autodetect
    pub devices: Vec<String>,

    /// Capacity of the captured-event channel; overflow drops oldest
    pub queue_capacity: usize,
}

/// Hotkey chord configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotkeyConfig {
    /// Master switch for chord detection on the captured key stream
    pub enabled: bool,
}

/// Emergency release configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    /// Seconds without input before control is forced back to local
    pub inactivity_timeout_secs: u64,

    /// Seconds during which switches are refused after an emergency release
    pub cooldown_secs: u64,

    /// Marker file whose presence forces release
    pub marker_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base log level ("error", "warn", "info", "debug", "trace")
    pub level: String,

    /// Output format ("pretty", "compact", "json")
    pub format: String,
}
