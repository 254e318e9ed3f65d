//! Core value types shared by transports, codecs and coordinators

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

// ============================================================================
// Connection state
// ============================================================================

/// Binary connection state of one transport client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl From<bool> for ConnectionState {
    fn from(connected: bool) -> Self {
        if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

// ============================================================================
// Decoded values
// ============================================================================

/// Decoded application value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProtocolValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Json(serde_json::Value),
    Null,
}

impl From<f64> for ProtocolValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ProtocolValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for ProtocolValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u16> for ProtocolValue {
    fn from(v: u16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for ProtocolValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ProtocolValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ProtocolValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl ProtocolValue {
    /// Parse a command-line style literal: bool, integer, float, JSON, else text
    pub fn parse_literal(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Integer(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Self::Float(f);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {},
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(v) = serde_json::from_str(trimmed) {
                return Self::Json(v);
            }
        }
        Self::String(text.to_string())
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse().ok(),
            Self::Json(v) => v.as_f64(),
            Self::Null => None,
        }
    }

    /// Try to convert to i64 (floats are rounded)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(f.round() as i64),
            Self::Float(_) => None,
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => {
                let s = s.trim();
                s.parse()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
            },
            Self::Json(v) => v.as_i64(),
            Self::Null => None,
        }
    }

    /// Try to convert to bool using the on/off token set
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::String(s) => parse_bool_token(s),
            Self::Json(v) => v.as_bool(),
            Self::Null => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Float(_))
    }
}

/// Recognized truthy/falsy tokens, case-insensitive
pub fn parse_bool_token(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl fmt::Display for ProtocolValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
            Self::Json(v) => write!(f, "{}", v),
            Self::Null => Ok(()),
        }
    }
}

// ============================================================================
// Raw wire values
// ============================================================================

/// Scalar normalized once at the transport boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Scalar plus the wire syntax it arrived with (e.g. "Counter32")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedScalar {
    pub syntax: String,
    pub value: Scalar,
}

impl TypedScalar {
    pub fn new(syntax: impl Into<String>, value: Scalar) -> Self {
        Self {
            syntax: syntax.into(),
            value,
        }
    }
}

/// A message received from a pub/sub broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    pub received_at: Instant,
}

/// Undecoded value as returned by a transport, or produced by an encoder
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// 16-bit register words
    Registers(Vec<u16>),
    /// Coil / discrete input states
    Bits(Vec<bool>),
    /// One typed scalar (SNMP GET)
    Scalar(TypedScalar),
    /// Ordered (OID, value) rows from a subtree walk
    Table(Vec<(String, TypedScalar)>),
    /// Received broker message
    Message(BrokerMessage),
    /// Outgoing publish payload
    Payload(Vec<u8>),
}

impl RawValue {
    /// Element count used for width checks and diagnostics
    pub fn size(&self) -> usize {
        match self {
            RawValue::Registers(r) => r.len(),
            RawValue::Bits(b) => b.len(),
            RawValue::Table(t) => t.len(),
            RawValue::Scalar(_) | RawValue::Message(_) => 1,
            RawValue::Payload(p) => p.len(),
        }
    }
}

// ============================================================================
// Poll results
// ============================================================================

/// One decoded entity value plus its optional display rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub value: ProtocolValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl PointValue {
    pub fn new(value: ProtocolValue) -> Self {
        Self {
            value,
            display: None,
        }
    }
}

/// Entity key to decoded value for one cycle. Failed entities are absent.
pub type PollResult = HashMap<String, PointValue>;
