//! Layered configuration for discovery, listener, control and gateway.
//!
//! Priority:
//! 1. Environment variables (`ARMARIO_*`)
//! 2. Config file (`~/.config/armario/config.toml`)
//! 3. Built-in defaults

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Expected prefix of the `device` field reported by locker firmware
pub const DEFAULT_FAMILY_PREFIX: &str = "AIRE-ESP32-";

/// Path every locker answers on with its identity
pub const DEFAULT_DISCOVERY_PATH: &str = "/discovery";

/// UDP port lockers announce themselves on
pub const DEFAULT_LISTENER_PORT: u16 = 4210;

const ENV_BATCH_SIZE: &str = "ARMARIO_BATCH_SIZE";
const ENV_PROBE_TIMEOUT_MS: &str = "ARMARIO_PROBE_TIMEOUT_MS";
const ENV_FAMILY_PREFIX: &str = "ARMARIO_FAMILY_PREFIX";
const ENV_LISTENER_PORT: &str = "ARMARIO_LISTENER_PORT";
const ENV_MAX_AGE_SECS: &str = "ARMARIO_MAX_AGE_SECS";
const ENV_SERVER_BIND: &str = "ARMARIO_SERVER_BIND";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    scan: Option<ScanSection>,
    listener: Option<ListenerSection>,
    control: Option<ControlSection>,
    server: Option<ServerSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ScanSection {
    batch_size: Option<usize>,
    probe_timeout_ms: Option<u64>,
    batch_delay_ms: Option<u64>,
    first_host: Option<u8>,
    last_host: Option<u8>,
    device_port: Option<u16>,
    discovery_path: Option<String>,
    family_prefix: Option<String>,
    fallback_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ListenerSection {
    port: Option<u16>,
    bind_address: Option<String>,
    broadcast_address: Option<String>,
    grace_period_secs: Option<u64>,
    max_age_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ControlSection {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerSection {
    bind: Option<String>,
}

/// Tunables for the active sweep and the per-host probe
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub probe_timeout: Duration,
    pub batch_delay: Duration,
    pub first_host: u8,
    pub last_host: u8,
    pub device_port: u16,
    pub discovery_path: String,
    pub family_prefix: String,
    /// Prefixes swept when no range can be derived from the caller or the host
    pub fallback_prefixes: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            probe_timeout: Duration::from_millis(2500),
            batch_delay: Duration::from_millis(100),
            first_host: 1,
            last_host: 254,
            device_port: 80,
            discovery_path: DEFAULT_DISCOVERY_PATH.to_string(),
            family_prefix: DEFAULT_FAMILY_PREFIX.to_string(),
            fallback_prefixes: vec![
                "192.168.1".to_string(),
                "192.168.0".to_string(),
                "10.0.0".to_string(),
            ],
        }
    }
}

/// Settings for the passive announcement listener
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub port: u16,
    pub bind_address: String,
    pub broadcast_address: String,
    /// How long a scan waits for straggler announcements before reporting
    pub grace_period: Duration,
    /// Records not seen within this window are dropped from snapshots.
    /// `None` keeps every record for the lifetime of the listener.
    pub max_age: Option<Duration>,
    pub family_prefix: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_LISTENER_PORT,
            bind_address: "0.0.0.0".to_string(),
            broadcast_address: "255.255.255.255".to_string(),
            grace_period: Duration::from_secs(5),
            max_age: None,
            family_prefix: DEFAULT_FAMILY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    pub timeout: Duration,
    pub device_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            device_port: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3080".to_string(),
        }
    }
}

/// Effective runtime configuration
#[derive(Debug, Clone, Default)]
pub struct ArmarioConfig {
    pub scan: ScanConfig,
    pub listener: ListenerConfig,
    pub control: ControlConfig,
    pub server: ServerConfig,
    /// Source of the configuration (for logging)
    pub source: ConfigSource,
}

/// Where the configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Using default hardcoded values
    #[default]
    Default,
    /// At least one value came from an environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("armario").join("config.toml"))
}

/// Load configuration from the config file
fn load_config_file() -> Option<ConfigFile> {
    let path = get_config_file_path()?;

    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load configuration with priority: environment, config file, defaults.
pub fn load_config() -> ArmarioConfig {
    let mut config = ArmarioConfig::default();

    if let Some(file) = load_config_file() {
        apply_file(&mut config, file);
        config.source = ConfigSource::ConfigFile;
    }

    if apply_env_overrides(&mut config, |key| std::env::var(key).ok()) {
        config.source = ConfigSource::Environment;
    }

    normalize(&mut config);
    tracing::debug!("Effective configuration loaded from {}", config.source);
    config
}

/// Parse a TOML document into a configuration layered over the defaults.
pub fn parse_config(content: &str) -> anyhow::Result<ArmarioConfig> {
    use anyhow::Context;

    let file: ConfigFile = toml::from_str(content).context("Failed to parse config")?;
    let mut config = ArmarioConfig::default();
    apply_file(&mut config, file);
    config.source = ConfigSource::ConfigFile;
    normalize(&mut config);
    Ok(config)
}

fn apply_file(config: &mut ArmarioConfig, file: ConfigFile) {
    if let Some(scan) = file.scan {
        let target = &mut config.scan;
        if let Some(v) = scan.batch_size {
            target.batch_size = v;
        }
        if let Some(v) = scan.probe_timeout_ms {
            target.probe_timeout = Duration::from_millis(v);
        }
        if let Some(v) = scan.batch_delay_ms {
            target.batch_delay = Duration::from_millis(v);
        }
        if let Some(v) = scan.first_host {
            target.first_host = v;
        }
        if let Some(v) = scan.last_host {
            target.last_host = v;
        }
        if let Some(v) = scan.device_port {
            target.device_port = v;
        }
        if let Some(v) = scan.discovery_path {
            target.discovery_path = v;
        }
        if let Some(v) = scan.family_prefix {
            target.family_prefix = v;
        }
        if let Some(v) = scan.fallback_prefixes {
            target.fallback_prefixes = v;
        }
    }

    if let Some(listener) = file.listener {
        let target = &mut config.listener;
        if let Some(v) = listener.port {
            target.port = v;
        }
        if let Some(v) = listener.bind_address {
            target.bind_address = v;
        }
        if let Some(v) = listener.broadcast_address {
            target.broadcast_address = v;
        }
        if let Some(v) = listener.grace_period_secs {
            target.grace_period = Duration::from_secs(v);
        }
        if let Some(v) = listener.max_age_secs {
            target.max_age = Some(Duration::from_secs(v));
        }
    }

    if let Some(control) = file.control {
        if let Some(v) = control.timeout_ms {
            config.control.timeout = Duration::from_millis(v);
        }
    }

    if let Some(server) = file.server {
        if let Some(v) = server.bind {
            config.server.bind = v;
        }
    }
}

/// Apply `ARMARIO_*` overrides. Returns true if any variable was used.
fn apply_env_overrides(
    config: &mut ArmarioConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> bool {
    let mut applied = false;

    let read = |key: &str| -> Option<String> {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(raw) = read(ENV_BATCH_SIZE) {
        match raw.parse::<usize>() {
            Ok(v) => {
                config.scan.batch_size = v;
                applied = true;
            }
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", ENV_BATCH_SIZE, raw),
        }
    }

    if let Some(raw) = read(ENV_PROBE_TIMEOUT_MS) {
        match raw.parse::<u64>() {
            Ok(v) => {
                config.scan.probe_timeout = Duration::from_millis(v);
                applied = true;
            }
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", ENV_PROBE_TIMEOUT_MS, raw),
        }
    }

    if let Some(raw) = read(ENV_FAMILY_PREFIX) {
        config.scan.family_prefix = raw;
        applied = true;
    }

    if let Some(raw) = read(ENV_LISTENER_PORT) {
        match raw.parse::<u16>() {
            Ok(v) => {
                config.listener.port = v;
                applied = true;
            }
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", ENV_LISTENER_PORT, raw),
        }
    }

    if let Some(raw) = read(ENV_MAX_AGE_SECS) {
        match raw.parse::<u64>() {
            Ok(v) => {
                config.listener.max_age = Some(Duration::from_secs(v));
                applied = true;
            }
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", ENV_MAX_AGE_SECS, raw),
        }
    }

    if let Some(raw) = read(ENV_SERVER_BIND) {
        config.server.bind = raw;
        applied = true;
    }

    applied
}

/// Shortest probe timeout accepted; anything lower ends every probe at once.
const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Clamp values that would otherwise stall or invert a sweep.
fn normalize(config: &mut ArmarioConfig) {
    if config.scan.batch_size == 0 {
        tracing::warn!("batch_size 0 is not usable, using 1");
        config.scan.batch_size = 1;
    }

    if config.scan.probe_timeout < MIN_PROBE_TIMEOUT {
        tracing::warn!(
            "probe_timeout {:?} is too short to reach any locker, using {:?}",
            config.scan.probe_timeout,
            MIN_PROBE_TIMEOUT
        );
        config.scan.probe_timeout = MIN_PROBE_TIMEOUT;
    }

    if config.scan.first_host == 0 || config.scan.first_host > config.scan.last_host {
        let defaults = ScanConfig::default();
        tracing::warn!(
            "Host range {}..={} is invalid, using {}..={}",
            config.scan.first_host,
            config.scan.last_host,
            defaults.first_host,
            defaults.last_host
        );
        config.scan.first_host = defaults.first_host;
        config.scan.last_host = defaults.last_host;
    }

    if !config.scan.discovery_path.starts_with('/') {
        config.scan.discovery_path = format!("/{}", config.scan.discovery_path);
    }

    // The listener validates announcements against the same family
    config.listener.family_prefix = config.scan.family_prefix.clone();
    config.control.device_port = config.scan.device_port;
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/armario/config.toml".to_string())
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# Armario Configuration
# Place this file at: ~/.config/armario/config.toml

[scan]
# batch_size = 20
# probe_timeout_ms = 2500
# batch_delay_ms = 100
# first_host = 1
# last_host = 254
# device_port = 80
# discovery_path = "/discovery"
# family_prefix = "AIRE-ESP32-"
# fallback_prefixes = ["192.168.1", "192.168.0", "10.0.0"]

[listener]
# port = 4210
# bind_address = "0.0.0.0"
# broadcast_address = "255.255.255.255"
# grace_period_secs = 5
# Drop lockers not heard from within this many seconds (unset = keep forever)
# max_age_secs = 600

[control]
# timeout_ms = 5000

[server]
# bind = "0.0.0.0:3080"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ArmarioConfig::default();
        assert_eq!(config.scan.batch_size, 20);
        assert_eq!(config.scan.probe_timeout, Duration::from_millis(2500));
        assert_eq!(config.scan.family_prefix, "AIRE-ESP32-");
        assert_eq!(config.listener.max_age, None);
        assert_eq!(config.source, ConfigSource::Default);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = parse_config(
            r#"
            [scan]
            batch_size = 10
            discovery_path = "discovery"

            [listener]
            max_age_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.scan.batch_size, 10);
        assert_eq!(config.scan.discovery_path, "/discovery");
        assert_eq!(config.scan.last_host, 254);
        assert_eq!(config.listener.max_age, Some(Duration::from_secs(600)));
        assert_eq!(config.source, ConfigSource::ConfigFile);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(&generate_example_config()).unwrap();
        assert_eq!(config.scan, ScanConfig::default());
    }

    #[test]
    fn test_invalid_ranges_are_normalized() {
        let config = parse_config(
            r#"
            [scan]
            batch_size = 0
            first_host = 200
            last_host = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.scan.batch_size, 1);
        assert_eq!(config.scan.first_host, 1);
        assert_eq!(config.scan.last_host, 254);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BATCH_SIZE, "5"),
            (ENV_PROBE_TIMEOUT_MS, "not-a-number"),
            (ENV_FAMILY_PREFIX, "AIRE-ESP32S3-"),
        ]);

        let mut config = ArmarioConfig::default();
        let applied = apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        normalize(&mut config);

        assert!(applied);
        assert_eq!(config.scan.batch_size, 5);
        assert_eq!(config.scan.probe_timeout, Duration::from_millis(2500));
        assert_eq!(config.listener.family_prefix, "AIRE-ESP32S3-");
    }

    #[test]
    fn test_zero_probe_timeout_is_clamped() {
        let config = parse_config("[scan]\nprobe_timeout_ms = 0\n").unwrap();
        assert_eq!(config.scan.probe_timeout, MIN_PROBE_TIMEOUT);

        let env: HashMap<&str, &str> = HashMap::from([(ENV_PROBE_TIMEOUT_MS, "0")]);
        let mut config = ArmarioConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        normalize(&mut config);
        assert_eq!(config.scan.probe_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_no_env_overrides() {
        let mut config = ArmarioConfig::default();
        assert!(!apply_env_overrides(&mut config, |_| None));
    }
}
