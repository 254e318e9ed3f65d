//! Error handling for the polling service
//!
//! Transport and codec internals return [`PollSrvError`]. At the
//! [`TransportClient`](crate::core::client::TransportClient) boundary these
//! collapse into `Option`/`bool` plus a log line; only contract violations
//! (read-only targets, unsupported protocol versions) reach callers as errors.

use errors::FieldError;
use thiserror::Error;

/// Polling service error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollSrvError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Malformed frames, exception responses, unexpected echoes
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Value decode/encode failures
    #[error("Codec error: {0}")]
    CodecError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Write attempted on an entity configured `rw: read`
    #[error("Entity '{0}' is read-only")]
    ReadOnlyEntity(String),

    /// Write attempted on a read-only Modbus register kind
    #[error("Cannot write to {kind} register at address {address}")]
    ReadOnlyRegister { kind: String, address: u16 },

    /// Write attempted on an SNMP walk (table) target
    #[error("Cannot write to table walk target {0}")]
    ReadOnlyTarget(String),

    /// Feature or protocol version not supported
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Device or entity lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the polling service
pub type Result<T> = std::result::Result<T, PollSrvError>;

impl PollSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        PollSrvError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        PollSrvError::ConnectionError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        PollSrvError::ProtocolError(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        PollSrvError::CodecError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        PollSrvError::TimeoutError(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        PollSrvError::Unsupported(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        PollSrvError::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PollSrvError::InternalError(msg.into())
    }

    pub fn not_connected() -> Self {
        PollSrvError::ConnectionError("Not connected".to_string())
    }

    /// Contract violations are rejected before any wire I/O
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            PollSrvError::ReadOnlyEntity(_)
                | PollSrvError::ReadOnlyRegister { .. }
                | PollSrvError::ReadOnlyTarget(_)
                | PollSrvError::Unsupported(_)
        )
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for PollSrvError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            PollSrvError::TimeoutError(err.to_string())
        } else {
            PollSrvError::IoError(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for PollSrvError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PollSrvError::TimeoutError("operation timed out".to_string())
    }
}

impl From<serde_json::Error> for PollSrvError {
    fn from(err: serde_json::Error) -> Self {
        PollSrvError::CodecError(format!("JSON: {err}"))
    }
}

impl From<figment::Error> for PollSrvError {
    fn from(err: figment::Error) -> Self {
        PollSrvError::ConfigError(err.to_string())
    }
}

impl From<PollSrvError> for FieldError {
    fn from(err: PollSrvError) -> Self {
        match err {
            PollSrvError::ConfigError(msg) => FieldError::Configuration(msg),
            PollSrvError::ConnectionError(msg) => FieldError::ConnectionFailed {
                endpoint: "device".to_string(),
                reason: msg,
            },
            PollSrvError::ProtocolError(msg) => FieldError::Protocol {
                protocol: "field".to_string(),
                message: msg,
            },
            PollSrvError::CodecError(msg) => FieldError::Validation(msg),
            PollSrvError::TimeoutError(msg) => FieldError::Timeout(msg),
            e @ (PollSrvError::ReadOnlyEntity(_)
            | PollSrvError::ReadOnlyRegister { .. }
            | PollSrvError::ReadOnlyTarget(_)) => FieldError::ReadOnly(e.to_string()),
            PollSrvError::Unsupported(msg) => FieldError::Unsupported(msg),
            PollSrvError::NotFound(msg) => FieldError::NotFound { resource: msg },
            PollSrvError::IoError(msg) => {
                FieldError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
            },
            PollSrvError::InternalError(msg) => FieldError::Internal(msg),
        }
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn codec_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| PollSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| PollSrvError::ProtocolError(format!("{msg}: {e}")))
    }

    fn codec_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| PollSrvError::CodecError(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_contract_violations() {
        assert!(PollSrvError::ReadOnlyEntity("pump".into()).is_contract_violation());
        assert!(PollSrvError::ReadOnlyRegister {
            kind: "discrete".into(),
            address: 4
        }
        .is_contract_violation());
        assert!(PollSrvError::unsupported("SNMPv3").is_contract_violation());
        assert!(!PollSrvError::timeout("read").is_contract_violation());
    }

    #[test]
    fn test_read_only_maps_to_field_read_only() {
        let err: FieldError = PollSrvError::ReadOnlyRegister {
            kind: "input".into(),
            address: 30,
        }
        .into();
        assert_eq!(err.error_code(), "READ_ONLY");
        assert!(err.to_string().contains("input"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            PollSrvError::from(io),
            PollSrvError::TimeoutError(_)
        ));
    }

    #[test]
    fn test_error_ext_context() {
        let r: std::result::Result<u8, &str> = Err("bad");
        let e = r.codec_error("decode uint16").unwrap_err();
        assert_eq!(e.to_string(), "Codec error: decode uint16: bad");
    }
}
