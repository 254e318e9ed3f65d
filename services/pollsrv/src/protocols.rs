//! Protocol implementations
//!
//! Each protocol provides a [`TransportClient`](crate::core::client::TransportClient)
//! and a codec over its raw value shapes.

pub mod modbus;
pub mod mqtt;
pub mod snmp;
