//! Configuration for the register bridge.

use modlink_common::{Format, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest quantity of holding registers a single read may request.
pub const MAX_READ_QUANTITY: u16 = 125;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] modlink_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Remote endpoint and polling settings
    #[serde(default)]
    pub modbus: ModbusConfig,

    /// Observer/operator listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote register endpoint and polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Host address (IP or hostname)
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Timeout for one connection attempt in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for one range read in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Timeout for closing the session in milliseconds
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Consecutive failed connection attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between connection attempts in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Total number of registers held in the snapshot
    #[serde(default = "default_total_registers")]
    pub total_registers: usize,

    /// Register ranges to read each tick, in declaration order
    #[serde(default = "default_ranges")]
    pub ranges: Vec<RegisterRange>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_close_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    15
}

fn default_retry_interval_ms() -> u64 {
    15_000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_total_registers() -> usize {
    70
}

fn default_ranges() -> Vec<RegisterRange> {
    vec![RegisterRange::new(0, 70, "Batch 1A")]
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_modbus_port(),
            unit_id: default_unit_id(),
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            total_registers: default_total_registers(),
            ranges: default_ranges(),
        }
    }
}

impl ModbusConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A contiguous span of holding registers read as one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRange {
    /// Starting address (0-based), also the offset into the snapshot
    pub start: u16,

    /// Number of registers to read
    pub length: u16,

    /// Human-readable name used in logs
    pub name: String,
}

impl RegisterRange {
    pub fn new(start: u16, length: u16, name: impl Into<String>) -> Self {
        Self {
            start,
            length,
            name: name.into(),
        }
    }

    /// Snapshot indices covered by this range.
    pub fn span(&self) -> Range<usize> {
        let start = self.start as usize;
        start..start + self.length as usize
    }

    fn overlaps(&self, other: &RegisterRange) -> bool {
        let (a, b) = (self.span(), other.span());
        a.start < b.end && b.start < a.end
    }
}

/// Observer and operator listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// WebSocket path observers connect to
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Snapshot frame encoding
    #[serde(default)]
    pub format: Format,

    /// Snapshots queued per observer before further ones are dropped
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_observer_buffer() -> usize {
    16
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ws_path: default_ws_path(),
            format: Format::default(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

impl ServerConfig {
    /// Parse the listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e| {
            ConfigError::Validation(format!("invalid listen address '{}': {}", self.listen, e))
        })
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Upper bound on the whole shutdown sequence before forcing exit
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    3000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    ///
    /// The result is not validated; call [`BridgeConfig::validate`] once any
    /// command-line overrides have been applied.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(modlink_common::load_config(path)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let modbus = &self.modbus;

        if modbus.host.trim().is_empty() {
            return Err(ConfigError::Validation("host cannot be empty".to_string()));
        }

        if modbus.unit_id == 0 || modbus.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "unit_id must be 1-247, got {}",
                modbus.unit_id
            )));
        }

        for (name, value) in [
            ("connect_timeout_ms", modbus.connect_timeout_ms),
            ("read_timeout_ms", modbus.read_timeout_ms),
            ("close_timeout_ms", modbus.close_timeout_ms),
            ("retry_interval_ms", modbus.retry_interval_ms),
            ("poll_interval_ms", modbus.poll_interval_ms),
            ("grace_period_ms", self.shutdown.grace_period_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if modbus.max_retries == 0 {
            return Err(ConfigError::Validation(
                "max_retries must be at least 1".to_string(),
            ));
        }

        if modbus.total_registers == 0 {
            return Err(ConfigError::Validation(
                "total_registers must be greater than zero".to_string(),
            ));
        }

        if modbus.ranges.is_empty() {
            return Err(ConfigError::Validation(
                "At least one register range must be configured".to_string(),
            ));
        }

        for (index, range) in modbus.ranges.iter().enumerate() {
            if range.name.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Range #{}: name cannot be empty",
                    index
                )));
            }

            if range.length == 0 || range.length > MAX_READ_QUANTITY {
                return Err(ConfigError::Validation(format!(
                    "Range '{}': length must be 1-{}, got {}",
                    range.name, MAX_READ_QUANTITY, range.length
                )));
            }

            if range.span().end > modbus.total_registers {
                return Err(ConfigError::Validation(format!(
                    "Range '{}': registers {}..{} exceed total_registers ({})",
                    range.name,
                    range.span().start,
                    range.span().end,
                    modbus.total_registers
                )));
            }

            if let Some(other) = modbus.ranges[..index].iter().find(|r| r.overlaps(range)) {
                return Err(ConfigError::Validation(format!(
                    "Range '{}' overlaps range '{}'",
                    range.name, other.name
                )));
            }
        }

        if self.server.observer_buffer == 0 {
            return Err(ConfigError::Validation(
                "observer_buffer must be greater than zero".to_string(),
            ));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "ws_path must start with '/', got '{}'",
                self.server.ws_path
            )));
        }

        self.server.listen_addr()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let config = BridgeConfig::default();
        config.validate().unwrap();

        assert_eq!(config.modbus.host, "127.0.0.1");
        assert_eq!(config.modbus.port, 502);
        assert_eq!(config.modbus.unit_id, 1);
        assert_eq!(config.modbus.max_retries, 15);
        assert_eq!(config.modbus.retry_interval(), Duration::from_secs(15));
        assert_eq!(config.modbus.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.modbus.total_registers, 70);
        assert_eq!(config.modbus.ranges, vec![RegisterRange::new(0, 70, "Batch 1A")]);
        assert_eq!(config.server.listen, "0.0.0.0:3001");
        assert_eq!(config.shutdown.grace_period(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_config() {
        let json = r#"{
            modbus: {
                host: "192.168.1.10",
                unit_id: 3,
                poll_interval_ms: 500,
                total_registers: 100,
                ranges: [
                    { start: 0, length: 40, name: "tanks" },
                    { start: 60, length: 40, name: "pumps" },
                ],
            },
            server: { listen: "127.0.0.1:9000", format: "cbor" },
        }"#;

        let config: BridgeConfig = modlink_common::parse_config(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.modbus.host, "192.168.1.10");
        assert_eq!(config.modbus.port, 502); // default
        assert_eq!(config.modbus.unit_id, 3);
        assert_eq!(config.modbus.ranges.len(), 2);
        assert_eq!(config.modbus.ranges[1].span(), 60..100);
        assert_eq!(config.server.format, Format::Cbor);
        assert_eq!(config.server.ws_path, "/ws");
    }

    #[test]
    fn test_validate_empty_ranges() {
        let json = r#"{ modbus: { ranges: [] } }"#;

        let config: BridgeConfig = modlink_common::parse_config(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_range_out_of_bounds() {
        let json = r#"{
            modbus: {
                total_registers: 50,
                ranges: [{ start: 40, length: 20, name: "tail" }],
            },
        }"#;

        let config: BridgeConfig = modlink_common::parse_config(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceed total_registers"));
    }

    #[test]
    fn test_validate_overlapping_ranges() {
        let json = r#"{
            modbus: {
                ranges: [
                    { start: 0, length: 10, name: "a" },
                    { start: 9, length: 10, name: "b" },
                ],
            },
        }"#;

        let config: BridgeConfig = modlink_common::parse_config(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_validate_adjacent_ranges() {
        let json = r#"{
            modbus: {
                ranges: [
                    { start: 0, length: 10, name: "a" },
                    { start: 10, length: 10, name: "b" },
                ],
            },
        }"#;

        let config: BridgeConfig = modlink_common::parse_config(json).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_read_quantity_limit() {
        let json = r#"{
            modbus: {
                total_registers: 200,
                ranges: [{ start: 0, length: 126, name: "too-big" }],
            },
        }"#;

        let config: BridgeConfig = modlink_common::parse_config(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_unit_id_and_retries() {
        let mut config = BridgeConfig::default();
        config.modbus.unit_id = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.modbus.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.modbus.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_listen_address() {
        let mut config = BridgeConfig::default();
        config.server.listen = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{{ modbus: {{ host: 'plc.local', max_retries: 3 }}, logging: {{ level: 'debug' }} }}"
        )
        .unwrap();

        let config = BridgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.modbus.host, "plc.local");
        assert_eq!(config.modbus.max_retries, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = BridgeConfig::load_from_file("/nonexistent/modlink.json5");
        assert!(matches!(
            result,
            Err(ConfigError::Load(modlink_common::Error::Io(_)))
        ));
    }

    #[test]
    fn test_load_from_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ modbus: {{ host: ").unwrap();

        let result = BridgeConfig::load_from_file(file.path());
        assert!(matches!(
            result,
            Err(ConfigError::Load(modlink_common::Error::Config(_)))
        ));
    }

    #[test]
    fn test_listen_override_is_validated_after_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ server: {{ listen: 'not-an-address' }} }}").unwrap();

        // Loading does not validate; the override repairs the address.
        let mut config = BridgeConfig::load_from_file(file.path()).unwrap();
        assert!(config.validate().is_err());

        config.server.listen = "127.0.0.1:3001".to_string();
        config.validate().unwrap();
    }
}
