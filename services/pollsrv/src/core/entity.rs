//! Entity configuration
//!
//! An [`EntityConfig`] describes one addressable point. It is built once from
//! a loose [`EntityDefinition`](crate::core::config::EntityDefinition) at load
//! time and never re-validated at use sites.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::registry::Protocol;
use crate::error::{PollSrvError, Result};

/// Default wait for an MQTT message when no cached value is fresh
pub const DEFAULT_MQTT_WAIT: Duration = Duration::from_secs(5);

/// Stable internal key: lowercase, trimmed, whitespace and `/` become `_`
pub fn entity_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.trim().chars() {
        if c.is_whitespace() || c == '/' {
            if !last_sep {
                key.push('_');
            }
            last_sep = true;
        } else {
            key.extend(c.to_lowercase());
            last_sep = false;
        }
    }
    key
}

// ============================================================================
// Shared enums
// ============================================================================

/// Read/write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RwMode {
    #[default]
    Read,
    Write,
    Rw,
}

impl RwMode {
    pub fn can_read(self) -> bool {
        matches!(self, RwMode::Read | RwMode::Rw)
    }

    pub fn can_write(self) -> bool {
        matches!(self, RwMode::Write | RwMode::Rw)
    }
}

impl FromStr for RwMode {
    type Err = PollSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" | "r" => Ok(RwMode::Read),
            "write" | "w" => Ok(RwMode::Write),
            "rw" | "read_write" => Ok(RwMode::Rw),
            other => Err(PollSrvError::config(format!("unknown rw mode '{other}'"))),
        }
    }
}

/// Byte or word order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Big,
    Little,
}

impl FromStr for Order {
    type Err = PollSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "big" | "be" | "msb" => Ok(Order::Big),
            "little" | "le" | "lsb" => Ok(Order::Little),
            other => Err(PollSrvError::config(format!("unknown order '{other}'"))),
        }
    }
}

// ============================================================================
// Modbus
// ============================================================================

/// Concrete Modbus register kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterKind {
    /// Auto-detect trial order
    pub const DETECT_ORDER: [RegisterKind; 4] = [
        RegisterKind::Holding,
        RegisterKind::Input,
        RegisterKind::Coil,
        RegisterKind::Discrete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::Coil => "coil",
            RegisterKind::Discrete => "discrete",
        }
    }

    pub fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Discrete)
    }

    /// Only holding registers and coils accept writes
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Holding | RegisterKind::Coil)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured register type (`auto` triggers detection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Auto,
    #[default]
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterType {
    pub fn fixed(self) -> Option<RegisterKind> {
        match self {
            RegisterType::Auto => None,
            RegisterType::Holding => Some(RegisterKind::Holding),
            RegisterType::Input => Some(RegisterKind::Input),
            RegisterType::Coil => Some(RegisterKind::Coil),
            RegisterType::Discrete => Some(RegisterKind::Discrete),
        }
    }
}

impl FromStr for RegisterType {
    type Err = PollSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(RegisterType::Auto),
            "holding" => Ok(RegisterType::Holding),
            "input" => Ok(RegisterType::Input),
            "coil" => Ok(RegisterType::Coil),
            "discrete" => Ok(RegisterType::Discrete),
            other => Err(PollSrvError::config(format!(
                "unknown register type '{other}'"
            ))),
        }
    }
}

/// Modbus data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModbusDataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Uint64,
    Int64,
    String,
}

impl ModbusDataType {
    /// Register words occupied by one value. Strings default to one register.
    pub fn word_count(self) -> u16 {
        match self {
            ModbusDataType::Uint16 | ModbusDataType::Int16 | ModbusDataType::String => 1,
            ModbusDataType::Uint32 | ModbusDataType::Int32 | ModbusDataType::Float32 => 2,
            ModbusDataType::Uint64 | ModbusDataType::Int64 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModbusDataType::Uint16 => "uint16",
            ModbusDataType::Int16 => "int16",
            ModbusDataType::Uint32 => "uint32",
            ModbusDataType::Int32 => "int32",
            ModbusDataType::Float32 => "float32",
            ModbusDataType::Uint64 => "uint64",
            ModbusDataType::Int64 => "int64",
            ModbusDataType::String => "string",
        }
    }
}

impl FromStr for ModbusDataType {
    type Err = PollSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uint16" => Ok(Self::Uint16),
            "int16" => Ok(Self::Int16),
            "uint32" => Ok(Self::Uint32),
            "int32" => Ok(Self::Int32),
            "float32" | "float" => Ok(Self::Float32),
            "uint64" => Ok(Self::Uint64),
            "int64" => Ok(Self::Int64),
            "string" => Ok(Self::String),
            other => Err(PollSrvError::config(format!(
                "unknown modbus data type '{other}'"
            ))),
        }
    }
}

/// Modbus addressing and decode parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModbusPoint {
    pub address: u16,
    pub data_type: ModbusDataType,
    pub register_type: RegisterType,
    /// Carried for configuration compatibility; the decoder does not swap bytes
    pub byte_order: Order,
    pub word_order: Order,
    /// Element count override (registers, or bits for coil/discrete)
    pub count: Option<u16>,
    /// Unit id, taken from the device connection
    pub slave_id: Option<u8>,
}

impl ModbusPoint {
    /// Elements to request from the device
    pub fn read_count(&self) -> u16 {
        self.count.unwrap_or_else(|| self.data_type.word_count())
    }
}

// ============================================================================
// SNMP
// ============================================================================

/// SNMP data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnmpDataType {
    String,
    Integer,
    Counter32,
    Counter64,
    Gauge32,
    Timeticks,
}

impl SnmpDataType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, SnmpDataType::String)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SnmpDataType::String => "string",
            SnmpDataType::Integer => "integer",
            SnmpDataType::Counter32 => "counter32",
            SnmpDataType::Counter64 => "counter64",
            SnmpDataType::Gauge32 => "gauge32",
            SnmpDataType::Timeticks => "timeticks",
        }
    }
}

impl FromStr for SnmpDataType {
    type Err = PollSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "octetstring" => Ok(Self::String),
            "integer" | "int" => Ok(Self::Integer),
            "counter32" => Ok(Self::Counter32),
            "counter64" => Ok(Self::Counter64),
            "gauge32" | "gauge" => Ok(Self::Gauge32),
            "timeticks" => Ok(Self::Timeticks),
            other => Err(PollSrvError::config(format!(
                "unknown snmp data type '{other}'"
            ))),
        }
    }
}

/// SNMP object parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnmpPoint {
    pub oid: String,
    pub data_type: SnmpDataType,
    /// Subtree walk (table) instead of a single GET
    pub walk: bool,
}

// ============================================================================
// MQTT
// ============================================================================

/// MQTT payload data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttDataType {
    String,
    Integer,
    Float,
    Boolean,
    Json,
}

impl MqttDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            MqttDataType::String => "string",
            MqttDataType::Integer => "integer",
            MqttDataType::Float => "float",
            MqttDataType::Boolean => "boolean",
            MqttDataType::Json => "json",
        }
    }
}

impl FromStr for MqttDataType {
    type Err = PollSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(Self::String),
            "integer" | "int" => Ok(Self::Integer),
            "float" | "number" => Ok(Self::Float),
            "boolean" | "bool" => Ok(Self::Boolean),
            "json" => Ok(Self::Json),
            other => Err(PollSrvError::config(format!(
                "unknown mqtt data type '{other}'"
            ))),
        }
    }
}

/// MQTT topic parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MqttPoint {
    pub topic: String,
    pub data_type: MqttDataType,
    pub qos: u8,
    pub retain: bool,
    #[serde(with = "duration_secs")]
    pub wait: Duration,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

// ============================================================================
// Entity
// ============================================================================

/// Protocol-specific addressing of an entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum EntityTarget {
    Modbus(ModbusPoint),
    Snmp(SnmpPoint),
    Mqtt(MqttPoint),
}

impl EntityTarget {
    pub fn protocol(&self) -> Protocol {
        match self {
            EntityTarget::Modbus(_) => Protocol::Modbus,
            EntityTarget::Snmp(_) => Protocol::Snmp,
            EntityTarget::Mqtt(_) => Protocol::Mqtt,
        }
    }

    pub fn address(&self) -> Address {
        match self {
            EntityTarget::Modbus(p) => Address::Register(p.address),
            EntityTarget::Snmp(p) => Address::Oid(p.oid.clone()),
            EntityTarget::Mqtt(p) => Address::Topic(p.topic.clone()),
        }
    }

    pub fn data_type_name(&self) -> &'static str {
        match self {
            EntityTarget::Modbus(p) => p.data_type.as_str(),
            EntityTarget::Snmp(p) => p.data_type.as_str(),
            EntityTarget::Mqtt(p) => p.data_type.as_str(),
        }
    }
}

/// Protocol-specific address handed to a transport client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Register(u16),
    Oid(String),
    Topic(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Register(a) => write!(f, "{}", a),
            Address::Oid(o) => f.write_str(o),
            Address::Topic(t) => f.write_str(t),
        }
    }
}

/// One validated addressable point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityConfig {
    pub name: String,
    pub key: String,
    pub rw: RwMode,
    pub scale: f64,
    pub offset: f64,
    pub format: Option<String>,
    /// Raw value (as text) to display label, for select-style entities
    pub options: Option<BTreeMap<String, String>>,
    pub target: EntityTarget,
}

impl EntityConfig {
    /// Build an entity with default rw/scale/offset
    pub fn new(name: impl Into<String>, target: EntityTarget) -> Self {
        let name = name.into();
        Self {
            key: entity_key(&name),
            name,
            rw: RwMode::Read,
            scale: 1.0,
            offset: 0.0,
            format: None,
            options: None,
            target,
        }
    }

    pub fn with_rw(mut self, rw: RwMode) -> Self {
        self.rw = rw;
        self
    }

    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_options(mut self, options: BTreeMap<String, String>) -> Self {
        self.options = Some(options);
        self
    }

    pub fn address(&self) -> Address {
        self.target.address()
    }

    /// Label for a decoded value, if an options map is configured
    pub fn display_option(&self, raw: &str) -> Option<&str> {
        self.options
            .as_ref()
            .and_then(|opts| opts.get(raw))
            .map(String::as_str)
    }

    /// Raw value (as text) for a display label
    pub fn option_value(&self, label: &str) -> Option<&str> {
        self.options.as_ref().and_then(|opts| {
            opts.iter()
                .find(|(_, l)| l.as_str() == label)
                .map(|(raw, _)| raw.as_str())
        })
    }

    /// Apply one-off overrides without touching the stored configuration
    pub fn with_overrides(&self, overrides: &EntityOverrides) -> Result<EntityConfig> {
        let mut entity = self.clone();
        if let Some(scale) = overrides.scale {
            entity.scale = scale;
        }
        if let Some(offset) = overrides.offset {
            entity.offset = offset;
        }

        match &mut entity.target {
            EntityTarget::Modbus(point) => {
                if let Some(dt) = &overrides.data_type {
                    point.data_type = dt.parse()?;
                }
                if let Some(order) = overrides.byte_order {
                    point.byte_order = order;
                }
                if let Some(order) = overrides.word_order {
                    point.word_order = order;
                }
                if let Some(rt) = overrides.register_type {
                    point.register_type = rt;
                }
                if let Some(count) = overrides.count {
                    if count == 0 {
                        return Err(PollSrvError::config("count must be at least 1"));
                    }
                    point.count = Some(count);
                }
            },
            EntityTarget::Snmp(point) => {
                if let Some(dt) = &overrides.data_type {
                    point.data_type = dt.parse()?;
                }
            },
            EntityTarget::Mqtt(point) => {
                if let Some(dt) = &overrides.data_type {
                    point.data_type = dt.parse()?;
                }
            },
        }
        Ok(entity)
    }
}

/// Per-call overrides for on-demand reads and writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityOverrides {
    pub data_type: Option<String>,
    pub byte_order: Option<Order>,
    pub word_order: Option<Order>,
    pub register_type: Option<RegisterType>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub count: Option<u16>,
    /// Return the undecoded wire value plus metadata
    pub raw: bool,
}

impl EntityOverrides {
    pub fn raw() -> Self {
        Self {
            raw: true,
            ..Default::default()
        }
    }
}
