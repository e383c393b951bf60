//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments
//!
//! The search order for the config file is: explicit `--config` path,
//! `~/.config/waylink/config.toml`, `/etc/waylink/config.toml`. A missing
//! file falls back to defaults; a file that exists but does not parse is a
//! hard error (spelled out so typos do not silently revert the server to
//! defaults).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod types;

pub use types::{
    CaptureConfig, ClientConfig, EmergencyConfig, HotkeyConfig, LoggingConfig, ServerConfig,
};

/// Default TCP port for client sessions.
pub const DEFAULT_PORT: u16 = 52525;

/// Application name; well-known paths derive from it.
pub const APP_NAME: &str = "waylink";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server-role settings
    #[serde(default = "default_server")]
    pub server: ServerConfig,
    /// Client-role settings
    #[serde(default = "default_client")]
    pub client: ClientConfig,
    /// Device capture settings
    #[serde(default = "default_capture")]
    pub capture: CaptureConfig,
    /// Hotkey settings
    #[serde(default = "default_hotkeys")]
    pub hotkeys: HotkeyConfig,
    /// Emergency release settings
    #[serde(default = "default_emergency")]
    pub emergency: EmergencyConfig,
    /// Logging settings
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Load from the search path, or defaults when no file exists.
    pub fn load_default() -> Result<Self> {
        for candidate in Self::search_paths() {
            if candidate.exists() {
                return Self::load(&candidate);
            }
        }
        Ok(Self::default_config())
    }

    /// Candidate config file locations, most specific first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join(APP_NAME).join("config.toml"));
        }
        paths.push(PathBuf::from("/etc").join(APP_NAME).join("config.toml"));
        paths
    }

    /// Create default configuration
    pub fn default_config() -> Self {
        Config {
            server: default_server(),
            client: default_client(),
            capture: default_capture(),
            hotkeys: default_hotkeys(),
            emergency: default_emergency(),
            logging: default_logging(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0");
        }

        match self.server.trust_policy.as_str() {
            "open" | "strict" => {}
            other => anyhow::bail!("Invalid trust policy: {} (expected open|strict)", other),
        }

        if self.server.max_frame_size < 64 {
            anyhow::bail!(
                "max_frame_size {} is too small to carry any event",
                self.server.max_frame_size
            );
        }

        if self.capture.queue_capacity == 0 {
            anyhow::bail!("capture queue_capacity must be at least 1");
        }

        if self.emergency.inactivity_timeout_secs == 0 {
            anyhow::bail!("inactivity_timeout_secs must be at least 1");
        }

        if let Some(addr) = &self.client.server_addr {
            parse_host_port(addr).context("Invalid client server_addr")?;
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => anyhow::bail!("Invalid log format: {} (expected pretty|compact|json)", other),
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, listen: Option<String>, port: Option<u16>) -> Self {
        if let Some(listen) = listen {
            self.server.listen_addr = listen;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Split "host:port" into parts; the port is mandatory here because the
/// client has no other way to learn it.
pub fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {addr:?}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {addr:?}"))?;
    if host.is_empty() {
        anyhow::bail!("empty host in {addr:?}");
    }
    Ok((host.to_string(), port))
}

fn state_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join(APP_NAME)
}

fn default_server() -> ServerConfig {
    ServerConfig {
        listen_addr: "0.0.0.0".to_string(),
        port: DEFAULT_PORT,
        host_key_path: state_dir().join("host_key"),
        trust_store_path: state_dir().join("known_clients"),
        trust_policy: "open".to_string(),
        max_frame_size: crate::protocol::DEFAULT_MAX_FRAME,
    }
}

fn default_client() -> ClientConfig {
    ClientConfig {
        server_addr: None,
        user_key_path: None,
        name: None,
    }
}

fn default_capture() -> CaptureConfig {
    CaptureConfig {
        devices: Vec::new(),
        queue_capacity: 512,
    }
}

fn default_hotkeys() -> HotkeyConfig {
    HotkeyConfig { enabled: true }
}

fn default_emergency() -> EmergencyConfig {
    EmergencyConfig {
        inactivity_timeout_secs: 30,
        cooldown_secs: 3,
        marker_path: PathBuf::from("/tmp/waylink-release"),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: "info".to_string(),
        format: "pretty".to_string(),
    }
}
