//! Transport client capability
//!
//! Every protocol implements [`TransportClient`]. Errors never cross this
//! boundary: connection problems become `false`, read problems become `None`,
//! and the implementation logs the underlying cause.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::entity::{Address, RegisterKind};
use crate::core::registry::Protocol;
use crate::core::types::RawValue;

/// Options for one read
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadRequest {
    /// Register kind (Modbus only)
    pub kind: Option<RegisterKind>,
    /// Unit id on a shared bus; the client's own id when unset (Modbus only)
    pub slave_id: Option<u8>,
    /// Element count (registers or bits)
    pub count: u16,
    /// Subtree walk instead of a single GET (SNMP only)
    pub walk: bool,
    /// Maximum wait for a pushed value (MQTT only)
    pub wait: Option<Duration>,
}

impl ReadRequest {
    pub fn registers(kind: RegisterKind, count: u16) -> Self {
        Self {
            kind: Some(kind),
            count,
            ..Default::default()
        }
    }
}

/// Options for one write
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteRequest {
    /// Register kind (Modbus only)
    pub kind: Option<RegisterKind>,
    /// Unit id on a shared bus; the client's own id when unset (Modbus only)
    pub slave_id: Option<u8>,
    /// Publish QoS (MQTT only)
    pub qos: u8,
    /// Publish retain flag (MQTT only)
    pub retain: bool,
}

/// Uniform transport capability
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Protocol family of this client
    fn protocol(&self) -> Protocol;

    /// Human readable endpoint for logs
    fn endpoint(&self) -> String;

    /// Connect if needed. Idempotent; returns the resulting status.
    async fn connect(&mut self) -> bool;

    /// Best-effort disconnect; always leaves the client disconnected
    async fn disconnect(&mut self);

    /// Cheap status check
    fn is_connected(&self) -> bool;

    /// Read one address. `None` means no data.
    async fn read(&mut self, address: &Address, request: &ReadRequest) -> Option<RawValue>;

    /// Write one address. `true` iff the device acknowledged.
    async fn write(&mut self, address: &Address, value: &RawValue, request: &WriteRequest) -> bool;

    /// Prepare for upcoming reads (MQTT subscribes to every configured topic)
    async fn prime(&mut self, _addresses: &[Address]) {}
}
