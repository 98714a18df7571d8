//! flconf - Configuration loading for the FL Studio MIDI bridge
//!
//! Configuration comes from TOML files discovered in a fixed order
//! (system, user, local, CLI override) with later files overriding earlier
//! ones, then an `FLBRIDGE_*` environment overlay on top. The bridge never
//! invents endpoint names: the two MIDI port names are configuration inputs
//! and connecting without them fails fast.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

mod loader;

pub use loader::{
    apply_env_overrides, discover_config_files, expand_path, load, load_from_files, ConfigSources,
};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub ports: PortsConfig,
    pub render: RenderConfig,
    pub timeouts: TimeoutConfig,
    /// Parameter alias table: lowercase alias -> canonical parameter name.
    /// Consumed verbatim by the parameter directory.
    pub aliases: HashMap<String, String>,
    /// Pinned 7-bit client id; derived at connect time when absent.
    pub client_id: Option<u8>,
    /// Optional preset directory root, passed through to tooling.
    pub preset_dir: Option<PathBuf>,
}

/// The two MIDI endpoints, matched by name substring.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Output port carrying commands toward the host.
    pub request_port: String,
    /// Input port delivering host responses.
    pub response_port: String,
}

impl PortsConfig {
    /// Both endpoint names must be configured before connecting.
    pub fn is_complete(&self) -> bool {
        !self.request_port.is_empty() && !self.response_port.is_empty()
    }
}

/// Render-detection settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Directory to watch for rendered audio; watching is disabled when
    /// unset.
    pub watch_dir: Option<PathBuf>,
    /// Rendered-audio extension, compared case-insensitively.
    pub extension: String,
    /// A file must keep a stable size this long before it counts.
    pub stability_ms: u64,
    /// Size polling cadence while a candidate is settling.
    pub poll_ms: u64,
    /// Default deadline for an active render wait.
    pub await_timeout_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            watch_dir: None,
            extension: "wav".to_string(),
            stability_ms: 2_000,
            poll_ms: 500,
            await_timeout_ms: 120_000,
        }
    }
}

/// Request deadline settings. Resolution order is caller > per-command
/// override > class default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default for interactive commands.
    pub interactive_ms: u64,
    /// Default for discovery-class commands (full parameter-table walks).
    pub discovery_ms: u64,
    /// Heartbeat probe cadence.
    pub heartbeat_ms: u64,
    /// Per-command overrides keyed by wire name.
    pub per_command: HashMap<String, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            interactive_ms: 5_000,
            discovery_ms: 60_000,
            heartbeat_ms: 10_000,
            per_command: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BridgeConfig::default();
        assert!(!config.ports.is_complete());
        assert_eq!(config.render.extension, "wav");
        assert_eq!(config.render.stability_ms, 2_000);
        assert_eq!(config.render.poll_ms, 500);
        assert_eq!(config.timeouts.interactive_ms, 5_000);
        assert_eq!(config.timeouts.discovery_ms, 60_000);
        assert!(config.aliases.is_empty());
        assert!(config.client_id.is_none());
    }

    #[test]
    fn ports_complete_requires_both_names() {
        let mut ports = PortsConfig::default();
        assert!(!ports.is_complete());
        ports.request_port = "loopMIDI Bridge In".into();
        assert!(!ports.is_complete());
        ports.response_port = "loopMIDI Bridge Out".into();
        assert!(ports.is_complete());
    }
}
