//! fieldpoll basic library
//!
//! Provides functions shared by all services:
//! - logging (console + daily rolling file, runtime level reload)
//! - graceful shutdown signal handling
//! - service bootstrap helpers (banner, logging initialization)

pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::{LogConfig, LoggingConfig};

// Re-export common dependencies
pub use tokio;
