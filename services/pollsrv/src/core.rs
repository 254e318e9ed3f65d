//! Core polling components
//!
//! - **`client`** - the transport capability every protocol implements
//! - **`entity`** / **`config`** - validated entity and device configuration
//! - **`codec`** / **`format`** - value decode/encode and display templates
//! - **`poll`** - the poll cycle engine
//! - **`coordinator`** - scheduling, snapshots and on-demand read/write
//! - **`connection_pool`** - clients shared by physical connection
//! - **`registry`** - static protocol dispatch

pub mod bootstrap;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection_pool;
pub mod coordinator;
pub mod entity;
pub mod format;
pub mod poll;
pub mod registry;
pub mod types;
