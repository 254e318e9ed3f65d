//! Service configuration
//!
//! Loaded with figment from a YAML file plus `POLLSRV_`-prefixed environment
//! variables (`__` separates nesting levels, e.g.
//! `POLLSRV_LOGGING__LEVEL=debug`). Entity definitions are deserialized
//! loosely and validated once into [`EntityConfig`] values.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use common::LoggingConfig;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::entity::{
    EntityConfig, EntityTarget, ModbusDataType, ModbusPoint, MqttDataType, MqttPoint, Order,
    RegisterType, RwMode, SnmpDataType, SnmpPoint, DEFAULT_MQTT_WAIT,
};
use crate::core::format;
use crate::core::registry::Protocol;
use crate::error::{ErrorExt, PollSrvError, Result};
use crate::protocols::snmp::{Oid, SnmpVersion};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/pollsrv.yaml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "POLLSRV_";

/// Per-operation wire timeout when neither device nor service set one
pub const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

// ============================================================================
// Top level
// ============================================================================

/// Service section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
    pub description: Option<String>,
    /// Wire timeout in seconds for devices without their own
    pub default_timeout: f64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "pollsrv".to_string(),
            description: None,
            default_timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSection,
    pub logging: LoggingConfig,
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Provider chain: YAML file, then environment overrides
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(PollSrvError::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let config: AppConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML text (no environment layer)
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: AppConfig = Figment::from(Yaml::string(yaml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every device and entity, surfacing the first problem
    pub fn validate(&self) -> Result<()> {
        seconds_to_duration("service.default_timeout", self.service.default_timeout)?;
        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(PollSrvError::config("device name must not be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(PollSrvError::config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            if let Some(secs) = device.timeout {
                seconds_to_duration("timeout", secs).map_err(|e| device.contextualize(None, e))?;
            }
            device.entities()?;
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Result<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| PollSrvError::not_found(format!("device '{name}'")))
    }

    /// Service wire timeout; the built-in default if the value is unusable
    pub fn default_timeout(&self) -> Duration {
        seconds_to_duration("service.default_timeout", self.service.default_timeout)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64))
    }
}

// ============================================================================
// Devices and connections
// ============================================================================

/// One physical device and its entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub connection: ConnectionConfig,
    /// Polling period in seconds
    #[serde(default)]
    pub update_interval: Option<u64>,
    /// Wire timeout in seconds
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
}

impl DeviceConfig {
    pub fn protocol(&self) -> Protocol {
        self.connection.protocol()
    }

    pub fn interval(&self) -> Duration {
        match self.update_interval {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.protocol().default_interval(),
        }
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout
            .and_then(|secs| seconds_to_duration("timeout", secs).ok())
            .unwrap_or(default)
    }

    /// Validated entities in configuration order
    pub fn entities(&self) -> Result<Vec<EntityConfig>> {
        self.connection
            .validate()
            .map_err(|e| self.contextualize(None, e))?;

        let protocol = self.protocol();
        let slave_id = self.connection.slave_id();
        let mut keys = HashSet::new();
        let mut out = Vec::with_capacity(self.entities.len());
        for def in &self.entities {
            let mut entity = def
                .validate(protocol)
                .map_err(|e| self.contextualize(Some(&def.name), e))?;
            if let EntityTarget::Modbus(point) = &mut entity.target {
                point.slave_id = slave_id;
            }
            if !keys.insert(entity.key.clone()) {
                return Err(self.contextualize(
                    Some(&def.name),
                    PollSrvError::config(format!("duplicate entity key '{}'", entity.key)),
                ));
            }
            out.push(entity);
        }
        Ok(out)
    }

    fn contextualize(&self, entity: Option<&str>, err: PollSrvError) -> PollSrvError {
        let scope = match entity {
            Some(name) => format!("device '{}' entity '{}'", self.name, name),
            None => format!("device '{}'", self.name),
        };
        match err {
            PollSrvError::ConfigError(msg) => PollSrvError::config(format!("{scope}: {msg}")),
            PollSrvError::Unsupported(msg) => PollSrvError::unsupported(format!("{scope}: {msg}")),
            other => other,
        }
    }
}

fn default_modbus_port() -> u16 {
    crate::protocols::modbus::constants::DEFAULT_TCP_PORT
}

fn default_slave_id() -> u8 {
    crate::protocols::modbus::constants::DEFAULT_SLAVE_ID
}

fn default_baudrate() -> u32 {
    crate::protocols::modbus::constants::DEFAULT_BAUDRATE
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> u8 {
    1
}

fn default_bytesize() -> u8 {
    8
}

fn default_snmp_port() -> u16 {
    crate::protocols::snmp::client::DEFAULT_SNMP_PORT
}

fn default_community() -> String {
    crate::protocols::snmp::client::DEFAULT_COMMUNITY.to_string()
}

fn default_snmp_version() -> String {
    "2c".to_string()
}

fn default_snmp_retries() -> u32 {
    crate::protocols::snmp::client::DEFAULT_RETRIES
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Accept `version: 2c` as well as `version: 1`
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Text(String),
        Int(i64),
        Float(f64),
    }
    Ok(match Loose::deserialize(deserializer)? {
        Loose::Text(s) => s,
        Loose::Int(i) => i.to_string(),
        Loose::Float(f) => f.to_string(),
    })
}

/// Connection descriptor, tagged on `protocol`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ConnectionConfig {
    ModbusTcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default = "default_slave_id")]
        slave_id: u8,
    },
    ModbusUdp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default = "default_slave_id")]
        slave_id: u8,
    },
    ModbusRtu {
        port: String,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_stopbits")]
        stopbits: u8,
        #[serde(default = "default_bytesize")]
        bytesize: u8,
        #[serde(default = "default_slave_id")]
        slave_id: u8,
    },
    Snmp {
        host: String,
        #[serde(default = "default_snmp_port")]
        port: u16,
        #[serde(default = "default_community")]
        community: String,
        #[serde(default = "default_snmp_version", deserialize_with = "string_or_number")]
        version: String,
        #[serde(default = "default_snmp_retries")]
        retries: u32,
    },
    Mqtt {
        broker: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        client_id: Option<String>,
    },
}

impl ConnectionConfig {
    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionConfig::ModbusTcp { .. }
            | ConnectionConfig::ModbusUdp { .. }
            | ConnectionConfig::ModbusRtu { .. } => Protocol::Modbus,
            ConnectionConfig::Snmp { .. } => Protocol::Snmp,
            ConnectionConfig::Mqtt { .. } => Protocol::Mqtt,
        }
    }

    /// Modbus unit id; `None` for other protocols
    pub fn slave_id(&self) -> Option<u8> {
        match self {
            ConnectionConfig::ModbusTcp { slave_id, .. }
            | ConnectionConfig::ModbusUdp { slave_id, .. }
            | ConnectionConfig::ModbusRtu { slave_id, .. } => Some(*slave_id),
            _ => None,
        }
    }

    /// Physical connection identity used for client sharing
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey(match self {
            ConnectionConfig::ModbusTcp { host, port, .. } => format!("ip_tcp:{host}:{port}"),
            ConnectionConfig::ModbusUdp { host, port, .. } => format!("ip_udp:{host}:{port}"),
            ConnectionConfig::ModbusRtu {
                port,
                baudrate,
                parity,
                stopbits,
                bytesize,
                ..
            } => format!("serial:{port}:{baudrate}:{parity}:{stopbits}:{bytesize}"),
            ConnectionConfig::Snmp {
                host,
                port,
                community,
                ..
            } => format!("snmp:{host}:{port}:{community}"),
            ConnectionConfig::Mqtt { broker, port, .. } => format!("mqtt:{broker}:{port}"),
        })
    }

    /// Structural checks; SNMPv3 is reported as unsupported
    pub fn validate(&self) -> Result<()> {
        match self {
            ConnectionConfig::ModbusTcp { host, .. } | ConnectionConfig::ModbusUdp { host, .. } => {
                require_non_empty("host", host)
            },
            ConnectionConfig::ModbusRtu {
                port,
                baudrate,
                parity,
                stopbits,
                bytesize,
                ..
            } => {
                require_non_empty("port", port)?;
                if *baudrate == 0 {
                    return Err(PollSrvError::config("baudrate must be positive"));
                }
                if !matches!(parity.to_ascii_uppercase().as_str(), "N" | "E" | "O") {
                    return Err(PollSrvError::config(format!(
                        "parity must be N, E or O, got '{parity}'"
                    )));
                }
                if !matches!(stopbits, 1 | 2) {
                    return Err(PollSrvError::config(format!(
                        "stopbits must be 1 or 2, got {stopbits}"
                    )));
                }
                if !(5..=8).contains(bytesize) {
                    return Err(PollSrvError::config(format!(
                        "bytesize must be 5..=8, got {bytesize}"
                    )));
                }
                Ok(())
            },
            ConnectionConfig::Snmp { host, version, .. } => {
                require_non_empty("host", host)?;
                SnmpVersion::parse(version).map(|_| ())
            },
            ConnectionConfig::Mqtt { broker, .. } => require_non_empty("broker", broker),
        }
    }
}

/// Positive, finite seconds that fit a [`Duration`]
fn seconds_to_duration(field: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(PollSrvError::config(format!("{field} must be positive, got {secs}")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| PollSrvError::config(format!("{field} out of range: {secs}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(PollSrvError::config(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Physical connection identity (e.g. `ip_tcp:10.0.0.5:502`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionKey(pub String);

impl ConnectionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Register offset, OID or topic as written in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAddress {
    Number(i64),
    Text(String),
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawAddress::Number(n) => write!(f, "{n}"),
            RawAddress::Text(t) => f.write_str(t),
        }
    }
}

/// Entity as written in the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityDefinition {
    pub name: String,
    pub address: Option<RawAddress>,
    pub data_type: Option<String>,
    pub rw: Option<String>,
    pub register_type: Option<String>,
    pub byte_order: Option<String>,
    pub word_order: Option<String>,
    pub count: Option<u16>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub format: Option<String>,
    pub options: Option<BTreeMap<String, String>>,
    /// SNMP subtree walk
    pub walk: bool,
    /// MQTT publish QoS
    pub qos: Option<u8>,
    /// MQTT publish retain flag
    pub retain: bool,
    /// MQTT read wait in seconds
    pub wait: Option<f64>,
}

impl EntityDefinition {
    /// Strict conversion for `protocol`
    pub fn validate(&self, protocol: Protocol) -> Result<EntityConfig> {
        if self.name.trim().is_empty() {
            return Err(PollSrvError::config("entity name must not be empty"));
        }
        let address = self
            .address
            .as_ref()
            .ok_or_else(|| PollSrvError::config("address is required"))?;
        let data_type = self
            .data_type
            .as_deref()
            .ok_or_else(|| PollSrvError::config("data_type is required"))?;
        if self.count == Some(0) {
            return Err(PollSrvError::config("count must be at least 1"));
        }
        let rw = match &self.rw {
            Some(rw) => rw.parse::<RwMode>()?,
            None => RwMode::default(),
        };

        let target = match protocol {
            Protocol::Modbus => EntityTarget::Modbus(ModbusPoint {
                address: modbus_address(address)?,
                data_type: data_type.parse::<ModbusDataType>()?,
                register_type: parse_or_default::<RegisterType>(&self.register_type)?,
                byte_order: parse_or_default::<Order>(&self.byte_order)?,
                word_order: parse_or_default::<Order>(&self.word_order)?,
                count: self.count,
                slave_id: None,
            }),
            Protocol::Snmp => {
                EntityTarget::Snmp(SnmpPoint {
                    oid: Oid::parse(&address.to_string())?.to_string(),
                    data_type: data_type.parse::<SnmpDataType>()?,
                    walk: self.walk,
                })
            },
            Protocol::Mqtt => {
                let topic = address.to_string();
                if topic.trim().is_empty() {
                    return Err(PollSrvError::config("topic must not be empty"));
                }
                if rw.can_write() && (topic.contains('+') || topic.contains('#')) {
                    return Err(PollSrvError::config(format!(
                        "cannot publish to wildcard topic '{topic}'"
                    )));
                }
                let qos = self.qos.unwrap_or(0);
                if qos > 2 {
                    return Err(PollSrvError::config(format!("qos must be 0..=2, got {qos}")));
                }
                let wait = match self.wait {
                    Some(secs) => seconds_to_duration("wait", secs)?,
                    None => DEFAULT_MQTT_WAIT,
                };
                EntityTarget::Mqtt(MqttPoint {
                    topic,
                    data_type: data_type.parse::<MqttDataType>()?,
                    qos,
                    retain: self.retain,
                    wait,
                })
            },
        };

        let scale = self.scale.unwrap_or(1.0);
        let offset = self.offset.unwrap_or(0.0);
        if !scale.is_finite() || !offset.is_finite() {
            return Err(PollSrvError::config("scale and offset must be finite"));
        }

        let mut entity = EntityConfig::new(self.name.trim(), target)
            .with_rw(rw)
            .with_scale(scale, offset);
        if let Some(template) = &self.format {
            format::check(template)
                .map_err(|e| PollSrvError::config(format!("invalid format '{template}': {e}")))?;
            entity = entity.with_format(template.clone());
        }
        if let Some(options) = &self.options {
            entity = entity.with_options(options.clone());
        }
        Ok(entity)
    }
}

fn parse_or_default<T>(value: &Option<String>) -> Result<T>
where
    T: std::str::FromStr<Err = PollSrvError> + Default,
{
    match value {
        Some(text) => text.parse(),
        None => Ok(T::default()),
    }
}

/// Decimal or `0x` hex register offset in 0..=65535
fn modbus_address(address: &RawAddress) -> Result<u16> {
    match address {
        RawAddress::Number(n) => u16::try_from(*n)
            .map_err(|_| PollSrvError::config(format!("register address {n} out of range 0..=65535"))),
        RawAddress::Text(text) => {
            let text = text.trim();
            match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u16::from_str_radix(hex, 16),
                None => text.parse::<u16>(),
            }
            .config_error(&format!("invalid register address '{text}'"))
        },
    }
}
