//! Config file discovery, loading, and environment variable overlay.

use std::env;
use std::path::{Path, PathBuf};

use crate::{BridgeConfig, ConfigError};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local/cli); later files
/// override earlier ones. Only files that exist are returned. A CLI
/// override path replaces the local file.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/flbridge/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("flbridge/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("flbridge.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load configuration: discovered files merged in order, then env overlay.
pub fn load(cli_path: Option<&Path>) -> Result<(BridgeConfig, ConfigSources), ConfigError> {
    let files = discover_config_files(cli_path);
    let mut config = load_from_files(&files)?;
    let mut sources = ConfigSources {
        files,
        env_overrides: Vec::new(),
    };
    apply_env_overrides(&mut config, &mut sources);
    Ok((config, sources))
}

/// Parse and merge a list of TOML files over the defaults.
///
/// Merging happens at the TOML table level so a file may set a single key
/// without clobbering sibling values from earlier files.
pub fn load_from_files(paths: &[PathBuf]) -> Result<BridgeConfig, ConfigError> {
    let mut merged = toml::Table::new();

    for path in paths {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| {
            ConfigError::Parse {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;
        merge_tables(&mut merged, table);
    }

    let mut config: BridgeConfig =
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: paths.last().cloned().unwrap_or_default(),
                message: e.to_string(),
            })?;

    if let Some(dir) = config.render.watch_dir.take() {
        config.render.watch_dir = Some(expand_path(&dir.to_string_lossy()));
    }
    if let Some(dir) = config.preset_dir.take() {
        config.preset_dir = Some(expand_path(&dir.to_string_lossy()));
    }

    Ok(config)
}

/// Recursively overlay `overlay` onto `base`; scalar values replace, tables
/// merge key-by-key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `FLBRIDGE_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut BridgeConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("FLBRIDGE_REQUEST_PORT") {
        config.ports.request_port = v;
        sources.env_overrides.push("FLBRIDGE_REQUEST_PORT".to_string());
    }
    if let Ok(v) = env::var("FLBRIDGE_RESPONSE_PORT") {
        config.ports.response_port = v;
        sources.env_overrides.push("FLBRIDGE_RESPONSE_PORT".to_string());
    }
    if let Ok(v) = env::var("FLBRIDGE_RENDER_DIR") {
        config.render.watch_dir = Some(expand_path(&v));
        sources.env_overrides.push("FLBRIDGE_RENDER_DIR".to_string());
    }
    if let Ok(v) = env::var("FLBRIDGE_PRESET_DIR") {
        config.preset_dir = Some(expand_path(&v));
        sources.env_overrides.push("FLBRIDGE_PRESET_DIR".to_string());
    }
    if let Ok(v) = env::var("FLBRIDGE_CLIENT_ID") {
        if let Ok(id) = v.parse::<u8>() {
            config.client_id = Some(id & 0x7F);
            sources.env_overrides.push("FLBRIDGE_CLIENT_ID".to_string());
        }
    }
    if let Ok(v) = env::var("FLBRIDGE_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.timeouts.interactive_ms = ms;
            sources.env_overrides.push("FLBRIDGE_TIMEOUT_MS".to_string());
        }
    }
    if let Ok(v) = env::var("FLBRIDGE_DISCOVERY_TIMEOUT_MS") {
        if let Ok(ms) = v.parse() {
            config.timeouts.discovery_ms = ms;
            sources
                .env_overrides
                .push("FLBRIDGE_DISCOVERY_TIMEOUT_MS".to_string());
        }
    }
}

/// Expand `~` and a leading `$VAR` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }
    if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                return PathBuf::from(var_value).join(&stripped[slash_pos + 1..]);
            }
        } else if let Ok(var_value) = env::var(stripped) {
            return PathBuf::from(var_value);
        }
        return PathBuf::from(path);
    }
    PathBuf::from(path)
}
