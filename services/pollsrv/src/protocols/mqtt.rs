//! MQTT Protocol Implementation
//!
//! Broker-backed topics. The payload codec is always available; the client
//! needs the `mqtt` feature.

#[cfg(feature = "mqtt")]
pub mod client;
pub mod codec;

#[cfg(feature = "mqtt")]
pub use client::{MqttClient, MqttSettings};
