//! Modbus transport client

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::pdu::ModbusPdu;
use super::transport::{ModbusEndpoint, ModbusFramer};
use crate::core::client::{ReadRequest, TransportClient, WriteRequest};
use crate::core::entity::{Address, RegisterKind};
use crate::core::registry::Protocol;
use crate::core::types::RawValue;
use crate::error::{PollSrvError, Result};

/// Modbus master over TCP, UDP or RTU
pub struct ModbusClient {
    endpoint: ModbusEndpoint,
    slave_id: u8,
    timeout: Duration,
    framer: Option<ModbusFramer>,
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("endpoint", &self.endpoint)
            .field("slave_id", &self.slave_id)
            .field("connected", &self.framer.is_some())
            .finish()
    }
}

impl ModbusClient {
    pub fn new(endpoint: ModbusEndpoint, slave_id: u8, timeout: Duration) -> Self {
        Self {
            endpoint,
            slave_id,
            timeout,
            framer: None,
        }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    async fn exchange(&mut self, unit: u8, request: &ModbusPdu) -> Result<ModbusPdu> {
        let framer = self.framer.as_mut().ok_or_else(PollSrvError::not_connected)?;
        let result = framer.exchange(unit, request, self.timeout).await;
        if let Err(e) = &result {
            if self.link_is_broken(e) {
                debug!("Dropping Modbus link {}: {}", self.endpoint, e);
                self.framer = None;
            }
        }
        result
    }

    /// Stream links lose framing after I/O errors or a timed-out response
    fn link_is_broken(&self, err: &PollSrvError) -> bool {
        match err {
            PollSrvError::IoError(_) | PollSrvError::ConnectionError(_) => true,
            PollSrvError::TimeoutError(_) => matches!(self.endpoint, ModbusEndpoint::Tcp { .. }),
            _ => false,
        }
    }

    async fn read_kind(
        &mut self,
        unit: u8,
        address: u16,
        kind: RegisterKind,
        count: u16,
    ) -> Result<RawValue> {
        let request = ModbusPdu::read_request(kind, address, count)?;
        let response = self.exchange(unit, &request).await?;
        if kind.is_bit() {
            response.parse_bits(kind, count).map(RawValue::Bits)
        } else {
            response.parse_registers(kind, count).map(RawValue::Registers)
        }
    }

    async fn write_kind(
        &mut self,
        unit: u8,
        address: u16,
        kind: RegisterKind,
        value: &RawValue,
    ) -> Result<()> {
        if !kind.is_writable() {
            return Err(PollSrvError::ReadOnlyRegister {
                kind: kind.to_string(),
                address,
            });
        }
        let request = match (kind, value) {
            (RegisterKind::Holding, RawValue::Registers(words)) if words.len() == 1 => {
                ModbusPdu::write_single_register(address, words[0])?
            },
            (RegisterKind::Holding, RawValue::Registers(words)) => {
                ModbusPdu::write_multiple_registers(address, words)?
            },
            (RegisterKind::Coil, RawValue::Bits(bits)) if bits.len() == 1 => {
                ModbusPdu::write_single_coil(address, bits[0])?
            },
            (RegisterKind::Coil, RawValue::Bits(bits)) => {
                ModbusPdu::write_multiple_coils(address, bits)?
            },
            (kind, other) => {
                return Err(PollSrvError::codec(format!(
                    "cannot write {:?} to {} register",
                    other, kind
                )))
            },
        };
        let response = self.exchange(unit, &request).await?;
        response.check_write_echo(&request)
    }
}

#[async_trait]
impl TransportClient for ModbusClient {
    fn protocol(&self) -> Protocol {
        Protocol::Modbus
    }

    fn endpoint(&self) -> String {
        format!("{} (slave {})", self.endpoint, self.slave_id)
    }

    async fn connect(&mut self) -> bool {
        if self.framer.is_some() {
            return true;
        }
        match ModbusFramer::open(&self.endpoint, self.timeout).await {
            Ok(framer) => {
                info!("Modbus connected: {}", self.endpoint);
                self.framer = Some(framer);
                true
            },
            Err(e) => {
                warn!("Modbus connect {} failed: {}", self.endpoint, e);
                false
            },
        }
    }

    async fn disconnect(&mut self) {
        if self.framer.take().is_some() {
            info!("Modbus disconnected: {}", self.endpoint);
        }
    }

    fn is_connected(&self) -> bool {
        self.framer.is_some()
    }

    async fn read(&mut self, address: &Address, request: &ReadRequest) -> Option<RawValue> {
        let Address::Register(register) = address else {
            warn!("Modbus read with non-register address {}", address);
            return None;
        };
        let kind = request.kind.unwrap_or(RegisterKind::Holding);
        let unit = request.slave_id.unwrap_or(self.slave_id);
        match self.read_kind(unit, *register, kind, request.count.max(1)).await {
            Ok(raw) => Some(raw),
            Err(e) => {
                debug!("Modbus read {} {}x{} failed: {}", kind, register, request.count, e);
                None
            },
        }
    }

    async fn write(&mut self, address: &Address, value: &RawValue, request: &WriteRequest) -> bool {
        let Address::Register(register) = address else {
            warn!("Modbus write with non-register address {}", address);
            return false;
        };
        let kind = request.kind.unwrap_or(RegisterKind::Holding);
        let unit = request.slave_id.unwrap_or(self.slave_id);
        match self.write_kind(unit, *register, kind, value).await {
            Ok(()) => {
                debug!("Modbus write {} {} acknowledged", kind, register);
                true
            },
            Err(e) => {
                warn!("Modbus write {} {} failed: {}", kind, register, e);
                false
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn client() -> ModbusClient {
        ModbusClient::new(
            ModbusEndpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 1,
            },
            3,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_io_without_connection() {
        let mut c = client();
        assert!(!c.is_connected());
        let req = ReadRequest::registers(RegisterKind::Holding, 1);
        assert!(c.read(&Address::Register(0), &req).await.is_none());
        assert!(
            !c.write(
                &Address::Register(0),
                &RawValue::Registers(vec![1]),
                &WriteRequest::default()
            )
            .await
        );
    }

    #[tokio::test]
    async fn test_read_only_kind_rejected_before_io() {
        let mut c = client();
        let err = c
            .write_kind(3, 5, RegisterKind::Discrete, &RawValue::Bits(vec![true]))
            .await
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_endpoint_label() {
        assert_eq!(client().endpoint(), "tcp://127.0.0.1:1 (slave 3)");
        assert_eq!(client().slave_id(), 3);
    }
}
