//! Configuration for the headless host.

use std::path::Path;

use rdx_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Listen addresses.
    pub network: NetworkConfig,
    /// The synthetic display served to every client.
    pub display: DisplayConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Protocol, batching, encoding and quality tuning.
    pub engine: EngineConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address for stream sessions.
    pub tcp_listen: String,
    /// UDP address for datagram sessions. Empty disables UDP.
    pub udp_listen: String,
    /// Concurrent TCP sessions; further connections wait.
    pub max_sessions: usize,
}

/// Test-pattern display configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Animation frames per second.
    pub fps: u32,
    /// Height of the moving bar in pixels.
    pub bar_height: u32,
    /// Title sent as window metadata.
    pub title: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_listen: "0.0.0.0:7400".into(),
            udp_listen: String::new(),
            max_sessions: 4,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            fps: 30,
            bar_height: 40,
            title: "rdx test pattern".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────
