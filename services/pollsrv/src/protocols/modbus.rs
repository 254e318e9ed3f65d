//! Modbus Protocol Implementation
//!
//! Modbus TCP, UDP and RTU masters behind one client

pub mod client;
pub mod codec;
pub mod constants;
pub mod pdu;
pub mod simulator;
pub mod transport;

// Re-export commonly used types
pub use client::ModbusClient;
pub use simulator::ModbusSimulator;
pub use transport::ModbusEndpoint;
