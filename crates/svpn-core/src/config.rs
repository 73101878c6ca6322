//! Configuration resolution for SimpleVPN.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/svpn/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tunnel_config::CompileOptions;

/// Minimum ratio between the lease TTL and the heartbeat interval.
pub const MIN_TTL_TO_HEARTBEAT_RATIO: u64 = 4;

/// Complete SimpleVPN configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lease: LeaseConfig,
    pub store: StoreConfig,
    pub tunnel: TunnelEngineConfig,
    /// Free-form platform tag written into leases.
    pub platform: String,
    /// Directory for the device identity and last-code files.
    pub state_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease: LeaseConfig::default(),
            store: StoreConfig::default(),
            tunnel: TunnelEngineConfig::default(),
            platform: default_platform().to_string(),
            state_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// Lease timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// A lease not renewed for this long may be taken over (seconds).
    pub ttl_secs: u64,
    /// Heartbeat period (seconds).
    pub heartbeat_interval_secs: u64,
    /// Upper bound for a single renewal (seconds).
    pub renew_timeout_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 120,
            heartbeat_interval_secs: 15,
            renew_timeout_secs: 10,
        }
    }
}

impl LeaseConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn renew_timeout(&self) -> Duration {
        Duration::from_secs(self.renew_timeout_secs)
    }
}

/// Document store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: Option<PathBuf>,
    /// Collection holding code documents.
    pub codes_collection: String,
    /// Descriptor document used when a code names none, and in lock-free mode.
    pub default_connection_path: String,
    /// Timeout for each store call (seconds).
    pub op_timeout_secs: u64,
    /// Optimistic transaction attempts before reporting a conflict.
    pub max_transaction_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            codes_collection: "codes".to_string(),
            default_connection_path: "configs/current".to_string(),
            op_timeout_secs: 10,
            max_transaction_attempts: 5,
        }
    }
}

impl StoreConfig {
    pub const fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

/// External tunnel engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelEngineConfig {
    /// Engine binary (absolute path, or a name resolved via `PATH`).
    pub binary: PathBuf,
    /// Where the compiled configuration is written.
    pub config_path: Option<PathBuf>,
    pub interface_name: String,
    pub mtu: u32,
    pub doh_url: String,
    /// Substring of an engine log line that marks it ready.
    pub ready_marker: String,
    pub ready_timeout_secs: u64,
    pub terminate_timeout_secs: u64,
}

impl Default for TunnelEngineConfig {
    fn default() -> Self {
        let compile = CompileOptions::default();
        Self {
            binary: PathBuf::from("sing-box"),
            config_path: None,
            interface_name: compile.interface_name,
            mtu: compile.mtu,
            doh_url: compile.doh_url,
            ready_marker: "started".to_string(),
            ready_timeout_secs: 5,
            terminate_timeout_secs: 5,
        }
    }
}

impl TunnelEngineConfig {
    /// Compiler options derived from these settings.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            interface_name: self.interface_name.clone(),
            mtu: self.mtu,
            doh_url: self.doh_url.clone(),
            ..CompileOptions::default()
        }
    }
}

impl Config {
    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.lease.heartbeat_interval_secs == 0 || self.lease.ttl_secs == 0 {
            return Err(Error::Config(
                "lease.ttl_secs and lease.heartbeat_interval_secs must be non-zero".into(),
            ));
        }
        if self.lease.ttl_secs
            < self
                .lease
                .heartbeat_interval_secs
                .saturating_mul(MIN_TTL_TO_HEARTBEAT_RATIO)
        {
            return Err(Error::Config(format!(
                "lease.ttl_secs ({}) must be at least {MIN_TTL_TO_HEARTBEAT_RATIO}x lease.heartbeat_interval_secs ({})",
                self.lease.ttl_secs, self.lease.heartbeat_interval_secs
            )));
        }
        if self.lease.renew_timeout_secs == 0 || self.store.op_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if self.store.max_transaction_attempts == 0 {
            return Err(Error::Config(
                "store.max_transaction_attempts must be at least 1".into(),
            ));
        }
        if self.store.codes_collection.trim().is_empty() || self.store.codes_collection.contains('/')
        {
            return Err(Error::Config(
                "store.codes_collection must be a single path segment".into(),
            ));
        }
        Ok(())
    }

    /// State directory, falling back to the platform default.
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.clone().or_else(default_state_dir)
    }

    /// Database path, falling back to `<state dir>/store.db`.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.store
            .database_path
            .clone()
            .or_else(|| self.state_dir().map(|d| d.join("store.db")))
    }

    /// Engine config path, falling back to `<state dir>/engine/config.json`.
    pub fn engine_config_path(&self) -> Option<PathBuf> {
        self.tunnel
            .config_path
            .clone()
            .or_else(|| self.state_dir().map(|d| d.join("engine").join("config.json")))
    }
}

/// Platform tag for the running OS.
pub const fn default_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "desktop"
    }
}

/// Load configuration with hierarchical resolution.
///
/// Defaults, then the global settings file, then `explicit`, then `SVPN_*`
/// environment overrides. Files are merged key by key, so a later file only
/// overrides the keys it actually sets.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let global = global_config_path().filter(|p| p.exists());
    let layers: Vec<&Path> = global.as_deref().into_iter().chain(explicit).collect();
    let mut config = load_layered(&layers)?;

    apply_env_overrides(&mut config);

    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("svpn").join("settings.json"))
}

/// Default directory for local state files.
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("svpn"))
}

/// Deep-merge settings files in order and deserialize the result once.
fn load_layered(paths: &[&Path]) -> Result<Config> {
    let mut merged = Value::Object(Map::new());
    for path in paths {
        merge_values(&mut merged, read_settings(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

fn read_settings(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("SVPN_LEASE_TTL_SECS")
        && let Ok(n) = val.parse()
    {
        config.lease.ttl_secs = n;
    }
    if let Ok(val) = std::env::var("SVPN_HEARTBEAT_SECS")
        && let Ok(n) = val.parse()
    {
        config.lease.heartbeat_interval_secs = n;
    }
    if let Ok(val) = std::env::var("SVPN_ENGINE_BIN") {
        config.tunnel.binary = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("SVPN_PLATFORM") {
        config.platform = val;
    }
    if let Ok(val) = std::env::var("SVPN_LOG_LEVEL") {
        config.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.lease.ttl(), Duration::from_secs(120));
        assert_eq!(config.lease.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.store.default_connection_path, "configs/current");
    }

    #[test]
    fn ttl_must_cover_several_heartbeats() {
        let mut config = Config::default();
        config.lease.ttl_secs = 30;
        config.lease.heartbeat_interval_secs = 15;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.lease.ttl_secs = 60;
        config.validate().unwrap();
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let mut config = Config::default();
        config.lease.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"lease": {"ttl_secs": 90}, "platform": "linux-test"}"#).unwrap();

        let config = load_layered(&[path.as_path()]).unwrap();
        assert_eq!(config.lease.ttl_secs, 90);
        assert_eq!(config.lease.heartbeat_interval_secs, 15);
        assert_eq!(config.platform, "linux-test");
        assert_eq!(config.store.codes_collection, "codes");
    }

    #[test]
    fn later_file_overrides_only_its_own_keys() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let explicit = dir.path().join("explicit.json");
        std::fs::write(
            &global,
            r#"{"lease": {"ttl_secs": 90, "heartbeat_interval_secs": 10},
                "platform": "from-global",
                "tunnel": {"mtu": 1280}}"#,
        )
        .unwrap();
        std::fs::write(
            &explicit,
            r#"{"log_level": "debug", "lease": {"ttl_secs": 100}}"#,
        )
        .unwrap();

        let config = load_layered(&[global.as_path(), explicit.as_path()]).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.lease.ttl_secs, 100);
        assert_eq!(config.lease.heartbeat_interval_secs, 10);
        assert_eq!(config.platform, "from-global");
        assert_eq!(config.tunnel.mtu, 1280);
        assert_eq!(config.tunnel.ready_marker, "started");
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(load_layered(&[path.as_path()]), Err(Error::Config(_))));
    }

    #[test]
    fn huge_heartbeat_is_rejected_without_overflow() {
        let mut config = Config::default();
        config.lease.heartbeat_interval_secs = u64::MAX / 2;
        config.lease.ttl_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn derived_paths_follow_state_dir() {
        let config = Config {
            state_dir: Some(PathBuf::from("/var/lib/svpn")),
            ..Config::default()
        };
        assert_eq!(
            config.database_path(),
            Some(PathBuf::from("/var/lib/svpn/store.db"))
        );
        assert_eq!(
            config.engine_config_path(),
            Some(PathBuf::from("/var/lib/svpn/engine/config.json"))
        );
    }

    #[test]
    fn compile_options_follow_tunnel_settings() {
        let mut config = Config::default();
        config.tunnel.interface_name = "tun-x".into();
        config.tunnel.mtu = 1300;
        let options = config.tunnel.compile_options();
        assert_eq!(options.interface_name, "tun-x");
        assert_eq!(options.mtu, 1300);
    }
}
