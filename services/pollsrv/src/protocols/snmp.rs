//! SNMP Protocol Implementation
//!
//! v1 and v2c community-based GET, GETNEXT walks and SET. v3 is rejected.

pub mod ber;
pub mod client;
pub mod codec;

pub use ber::{Oid, SnmpVersion};
pub use client::SnmpClient;
