//! Field Device Polling Service (pollsrv)
//!
//! Polls field devices over Modbus (TCP, UDP, RTU), SNMP (v1/v2c) and MQTT,
//! decodes raw protocol values into typed, scaled values and offers
//! on-demand reads and writes against the same devices.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────────────┐    ┌──────────────────┐
//! │ AppConfig   │───►│ Runtime         │───►│ ConnectionPool   │
//! │ (YAML+env)  │    │ (one per proc)  │    │ (shared clients) │
//! └─────────────┘    └─────────────────┘    └──────────────────┘
//!                            │                       │
//!                            ▼                       ▼
//!                    ┌─────────────────┐    ┌──────────────────┐
//!                    │ Coordinator     │───►│ TransportClient  │
//!                    │ (per device)    │    │ Modbus/SNMP/MQTT │
//!                    └─────────────────┘    └──────────────────┘
//! ```
//!
//! Devices that sit behind the same physical connection (a serial line or
//! a gateway address) share one client. Every coordinator polls on its own
//! interval and publishes a [`Snapshot`] through a watch channel.

pub mod core;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use crate::core::client::{ReadRequest, TransportClient, WriteRequest};
pub use crate::core::config::{AppConfig, ConnectionConfig, DeviceConfig};
pub use crate::core::connection_pool::{ConnectionPool, SharedClient};
pub use crate::core::coordinator::{Coordinator, ReadOutput, Snapshot};
pub use crate::core::entity::{EntityConfig, EntityOverrides};
pub use crate::core::poll::PollEngine;
pub use crate::core::registry::Protocol;
pub use crate::core::types::{PointValue, PollResult, ProtocolValue, RawValue};
pub use crate::error::{PollSrvError, Result};
pub use crate::runtime::Runtime;
