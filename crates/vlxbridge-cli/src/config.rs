//! Configuration file – the TOML document named on the command line.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use vlxbridge_hal::{SimGateway, SimNodeSpec};
use vlxbridge_middleware::MqttSettings;
use vlxbridge_runtime::{LogSettings, Naming, RegistrySettings};
use vlxbridge_types::BridgeError;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A password read from the configuration.  Wiped on drop and never shown
/// by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_empty() { "<not set>" } else { "<redacted>" })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub velux: VeluxSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
    /// Prepended to device names and entity ids.
    #[serde(default)]
    pub haprefix: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// Defaults to `vlxmqttha_<pid>`.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

/// Gateway address and credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VeluxSection {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub password: Option<Secret>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub klf200: bool,
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_max_concurrent_commands")]
    pub max_concurrent_commands: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub invert_awnings: bool,
    #[serde(default = "default_strict_identity")]
    pub strict_identity: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_pidfile")]
    pub pidfile: PathBuf,
}

/// Inventory of the simulated gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySection {
    #[serde(default)]
    pub devices: Vec<SimNodeSpec>,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_reconnect_delay_secs() -> u64 {
    10
}
fn default_max_concurrent_commands() -> usize {
    2
}
fn default_worker_count() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    64
}
fn default_settle_delay_ms() -> u64 {
    10
}
fn default_strict_identity() -> bool {
    true
}
fn default_pidfile() -> PathBuf {
    PathBuf::from("/tmp/vlxmqtthomeassistant.pid")
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            max_concurrent_commands: default_max_concurrent_commands(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            acquire_timeout_ms: None,
            settle_delay_ms: default_settle_delay_ms(),
            invert_awnings: false,
            strict_identity: default_strict_identity(),
        }
    }
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            pidfile: default_pidfile(),
        }
    }
}

impl Config {
    pub fn mqtt_settings(&self) -> MqttSettings {
        let mut settings = MqttSettings::new(&self.mqtt.host, self.mqtt.port);
        if let Some(client_id) = &self.mqtt.client_id {
            settings.client_id = client_id.clone();
        }
        settings.login = self.mqtt.login.clone();
        settings.password = self.mqtt.password.as_ref().map(|p| p.expose().to_string());
        settings.keep_alive = Duration::from_secs(self.mqtt.keep_alive_secs);
        settings.reconnect_delay = Duration::from_secs(self.mqtt.reconnect_delay_secs);
        settings
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            verbose: self.log.verbose,
            klf200: self.log.klf200,
            logfile: self.log.logfile.clone(),
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        let bridge = &self.bridge;
        RegistrySettings {
            naming: Naming {
                discovery_prefix: self.mqtt.discovery_prefix.clone(),
                haprefix: self.mqtt.haprefix.clone(),
            },
            max_concurrent_commands: bridge.max_concurrent_commands,
            acquire_timeout: bridge.acquire_timeout_ms.map(Duration::from_millis),
            worker_count: bridge.worker_count,
            queue_capacity: bridge.queue_capacity,
            settle_delay: Duration::from_millis(bridge.settle_delay_ms),
            invert_awnings: bridge.invert_awnings,
            strict_identity: bridge.strict_identity,
        }
    }

    pub fn sim_gateway(&self) -> SimGateway {
        SimGateway::builder()
            .with_nodes(self.gateway.devices.iter().cloned())
            .build()
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(BridgeError::Config("[mqtt] host must not be empty".into()));
        }
        for (key, value) in [
            ("max_concurrent_commands", self.bridge.max_concurrent_commands),
            ("worker_count", self.bridge.worker_count),
            ("queue_capacity", self.bridge.queue_capacity),
        ] {
            if value == 0 {
                return Err(BridgeError::Config(format!("[bridge] {key} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// Load, override from the environment and validate the config at `path`.
pub fn load_from(path: &Path) -> Result<Config, BridgeError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("Failed to read config at {}: {}", path.display(), e))
    })?;
    let mut cfg = parse(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

pub(crate) fn parse(raw: &str) -> Result<Config, BridgeError> {
    toml::from_str(raw).map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)))
}

/// Apply `VLXBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `VLXBRIDGE_MQTT_HOST` | `mqtt.host` |
/// | `VLXBRIDGE_MQTT_PORT` | `mqtt.port` |
/// | `VLXBRIDGE_MQTT_LOGIN` | `mqtt.login` |
/// | `VLXBRIDGE_MQTT_PASSWORD` | `mqtt.password` |
/// | `VLXBRIDGE_HAPREFIX` | `mqtt.haprefix` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("VLXBRIDGE_MQTT_HOST") {
        cfg.mqtt.host = v;
    }
    if let Ok(v) = std::env::var("VLXBRIDGE_MQTT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.mqtt.port = port;
    }
    if let Ok(v) = std::env::var("VLXBRIDGE_MQTT_LOGIN") {
        cfg.mqtt.login = Some(v);
    }
    if let Ok(v) = std::env::var("VLXBRIDGE_MQTT_PASSWORD") {
        cfg.mqtt.password = Some(Secret::new(v));
    }
    if let Ok(v) = std::env::var("VLXBRIDGE_HAPREFIX") {
        cfg.mqtt.haprefix = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlxbridge_types::{DeviceCategory, Percent};

    const MINIMAL: &str = r#"
        [mqtt]
        host = "broker.local"
    "#;

    const FULL: &str = r#"
        [mqtt]
        host = "broker.local"
        port = 8883
        login = "ha"
        password = "mqtt-secret"
        haprefix = "test-"

        [velux]
        host = "klf200.local"
        password = "velux-secret"

        [log]
        verbose = true
        klf200 = true
        logfile = "/var/log/vlxmqttha.log"

        [bridge]
        max_concurrent_commands = 3
        acquire_timeout_ms = 5000
        invert_awnings = true

        [daemon]
        pidfile = "/run/vlxmqttha.pid"

        [[gateway.devices]]
        name = "Bad Fenster"
        category = "window"
        position = 100

        [[gateway.devices]]
        name = "Terrasse"
        category = "awning"
        travel_ms = 1500
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse(MINIMAL).unwrap();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.discovery_prefix, "homeassistant");
        assert_eq!(cfg.mqtt.haprefix, "");
        assert_eq!(cfg.bridge.max_concurrent_commands, 2);
        assert!(cfg.bridge.strict_identity);
        assert!(!cfg.bridge.invert_awnings);
        assert_eq!(cfg.daemon.pidfile, PathBuf::from("/tmp/vlxmqtthomeassistant.pid"));
        assert!(cfg.gateway.devices.is_empty());

        let mqtt = cfg.mqtt_settings();
        assert!(mqtt.client_id.starts_with("vlxmqttha_"));
        assert_eq!(mqtt.reconnect_delay, Duration::from_secs(10));
    }

    #[test]
    fn full_config_maps_into_settings() {
        let cfg = parse(FULL).unwrap();

        let mqtt = cfg.mqtt_settings();
        assert_eq!((mqtt.host.as_str(), mqtt.port), ("broker.local", 8883));
        assert_eq!(mqtt.password.as_deref(), Some("mqtt-secret"));

        let registry = cfg.registry_settings();
        assert_eq!(registry.naming.haprefix, "test-");
        assert_eq!(registry.max_concurrent_commands, 3);
        assert_eq!(registry.acquire_timeout, Some(Duration::from_secs(5)));
        assert!(registry.invert_awnings);

        let log = cfg.log_settings();
        assert!(log.verbose && log.klf200);
        assert_eq!(log.logfile, Some(PathBuf::from("/var/log/vlxmqttha.log")));

        assert_eq!(cfg.gateway.devices.len(), 2);
        assert_eq!(cfg.gateway.devices[0].category, DeviceCategory::Window);
        assert_eq!(cfg.gateway.devices[0].position, Percent::MAX);
        let gateway = cfg.sim_gateway();
        assert!(gateway.node_by_name("Terrasse").is_some());
    }

    #[test]
    fn config_debug_redacts_passwords() {
        let cfg = parse(FULL).unwrap();
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("mqtt-secret"), "mqtt password must not appear in debug output");
        assert!(!debug_str.contains("velux-secret"), "velux password must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
        assert!(!format!("{:?}", cfg.mqtt_settings()).contains("mqtt-secret"));
    }

    #[test]
    fn missing_mqtt_section_is_rejected() {
        assert!(matches!(parse("[log]\nverbose = true"), Err(BridgeError::Config(_))));
    }

    #[test]
    fn zero_permits_fail_validation() {
        let mut cfg = parse(MINIMAL).unwrap();
        cfg.bridge.max_concurrent_commands = 0;
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        let raw = format!("{MINIMAL}\n[[gateway.devices]]\nname = \"X\"\ncategory = \"window\"\nposition = 130\n");
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("vlxmqttha.toml");
        fs::write(&path, FULL).expect("write");
        let cfg = load_from(&path).expect("load ok");
        assert_eq!(cfg.velux.host, "klf200.local");
    }

    #[test]
    fn load_from_missing_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    // Every override in one test; the process environment is shared between
    // test threads.
    #[test]
    fn apply_env_overrides_replaces_broker_fields() {
        // SAFETY: no other test in this crate reads these variables.
        unsafe {
            std::env::set_var("VLXBRIDGE_MQTT_HOST", "other-broker");
            std::env::set_var("VLXBRIDGE_MQTT_PORT", "not-a-port");
            std::env::set_var("VLXBRIDGE_MQTT_LOGIN", "bridge");
            std::env::set_var("VLXBRIDGE_MQTT_PASSWORD", "env-secret");
            std::env::set_var("VLXBRIDGE_HAPREFIX", "dev-");
        }
        let mut cfg = parse(MINIMAL).unwrap();
        apply_env_overrides(&mut cfg);
        unsafe {
            for var in [
                "VLXBRIDGE_MQTT_HOST",
                "VLXBRIDGE_MQTT_PORT",
                "VLXBRIDGE_MQTT_LOGIN",
                "VLXBRIDGE_MQTT_PASSWORD",
                "VLXBRIDGE_HAPREFIX",
            ] {
                std::env::remove_var(var);
            }
        }

        assert_eq!(cfg.mqtt.host, "other-broker");
        assert_eq!(cfg.mqtt.port, 1883, "invalid port override is ignored");
        assert_eq!(cfg.mqtt.login.as_deref(), Some("bridge"));
        assert_eq!(cfg.mqtt.password.as_ref().map(Secret::expose), Some("env-secret"));
        assert_eq!(cfg.mqtt.haprefix, "dev-");
    }
}
