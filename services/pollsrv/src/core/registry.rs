//! Protocol registry
//!
//! The protocol set is fixed at compile time, so dispatch is an exhaustive
//! match over [`Protocol`] rather than a name-keyed lookup table.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::client::TransportClient;
use crate::core::config::ConnectionConfig;
use crate::error::{PollSrvError, Result};
use crate::protocols::modbus::{ModbusClient, ModbusEndpoint};
use crate::protocols::snmp::SnmpClient;

/// Supported protocol families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Snmp,
    Mqtt,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Modbus, Protocol::Snmp, Protocol::Mqtt];

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Modbus => "modbus",
            Protocol::Snmp => "snmp",
            Protocol::Mqtt => "mqtt",
        }
    }

    /// Polling period used when a device does not configure one
    pub fn default_interval(self) -> Duration {
        match self {
            Protocol::Modbus => Duration::from_secs(10),
            Protocol::Snmp | Protocol::Mqtt => Duration::from_secs(30),
        }
    }

    /// Whether this build carries a client for the protocol
    pub fn is_available(self) -> bool {
        match self {
            Protocol::Modbus | Protocol::Snmp => true,
            Protocol::Mqtt => cfg!(feature = "mqtt"),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = PollSrvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modbus" | "modbus_tcp" | "modbus_udp" | "modbus_rtu" => Ok(Protocol::Modbus),
            "snmp" => Ok(Protocol::Snmp),
            "mqtt" => Ok(Protocol::Mqtt),
            other => Err(PollSrvError::config(format!("unknown protocol '{other}'"))),
        }
    }
}

/// Construct the transport client for a connection descriptor
pub fn build_client(config: &ConnectionConfig, timeout: Duration) -> Result<Box<dyn TransportClient>> {
    debug!("Building {} client for {}", config.protocol(), config.key());
    match config {
        ConnectionConfig::ModbusTcp {
            host,
            port,
            slave_id,
        } => Ok(Box::new(ModbusClient::new(
            ModbusEndpoint::Tcp {
                host: host.clone(),
                port: *port,
            },
            *slave_id,
            timeout,
        ))),
        ConnectionConfig::ModbusUdp {
            host,
            port,
            slave_id,
        } => Ok(Box::new(ModbusClient::new(
            ModbusEndpoint::Udp {
                host: host.clone(),
                port: *port,
            },
            *slave_id,
            timeout,
        ))),
        ConnectionConfig::ModbusRtu {
            port,
            baudrate,
            parity,
            stopbits,
            bytesize,
            slave_id,
        } => Ok(Box::new(ModbusClient::new(
            ModbusEndpoint::Rtu {
                port: port.clone(),
                baudrate: *baudrate,
                parity: parity.chars().next().unwrap_or('N'),
                stopbits: *stopbits,
                bytesize: *bytesize,
            },
            *slave_id,
            timeout,
        ))),
        ConnectionConfig::Snmp {
            host,
            port,
            community,
            version,
            retries,
        } => Ok(Box::new(SnmpClient::new(
            host.clone(),
            *port,
            community.clone(),
            version,
            timeout,
            *retries,
        )?)),
        #[cfg(feature = "mqtt")]
        ConnectionConfig::Mqtt {
            broker,
            port,
            username,
            password,
            client_id,
        } => {
            use crate::protocols::mqtt::{MqttClient, MqttSettings};
            Ok(Box::new(MqttClient::new(
                MqttSettings {
                    broker: broker.clone(),
                    port: *port,
                    username: username.clone(),
                    password: password.clone(),
                    client_id: client_id.clone(),
                },
                timeout,
            )))
        },
        #[cfg(not(feature = "mqtt"))]
        ConnectionConfig::Mqtt { .. } => Err(PollSrvError::unsupported(
            "MQTT support requires the mqtt feature",
        )),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        assert_eq!(Protocol::Modbus.default_interval(), Duration::from_secs(10));
        assert_eq!(Protocol::Snmp.default_interval(), Duration::from_secs(30));
        assert_eq!(Protocol::Mqtt.default_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_names_round_trip() {
        for p in Protocol::ALL {
            assert_eq!(p.name().parse::<Protocol>().unwrap(), p);
        }
        assert_eq!("modbus_rtu".parse::<Protocol>().unwrap(), Protocol::Modbus);
        assert!("bacnet".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_build_modbus_client() {
        let config = ConnectionConfig::ModbusTcp {
            host: "127.0.0.1".into(),
            port: 1502,
            slave_id: 3,
        };
        let client = build_client(&config, Duration::from_secs(1)).unwrap();
        assert_eq!(client.protocol(), Protocol::Modbus);
        assert!(!client.is_connected());
        assert!(client.endpoint().contains("1502"));
    }

    #[test]
    fn test_snmp_v3_is_unsupported() {
        let config = ConnectionConfig::Snmp {
            host: "10.0.0.1".into(),
            port: 161,
            community: "public".into(),
            version: "3".into(),
            retries: 1,
        };
        let err = build_client(&config, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, PollSrvError::Unsupported(_)));
    }
}
