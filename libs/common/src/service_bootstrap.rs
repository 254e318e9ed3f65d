//! Unified service bootstrap utilities
//!
//! Startup banner and logging initialization shared by fieldpoll binaries.

use crate::logging::{self, LogConfig, LoggingConfig};
use errors::{FieldError, FieldResult};
use tracing::{info, Level};

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "pollsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Print unified startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ███████╗██╗███████╗██╗     ██████╗ ██████╗  ██████╗ ██╗     ██╗
 ██╔════╝██║██╔════╝██║     ██╔══██╗██╔══██╗██╔═══██╗██║     ██║
 █████╗  ██║█████╗  ██║     ██║  ██║██████╔╝██║   ██║██║     ██║
 ██╔══╝  ██║██╔══╝  ██║     ██║  ██║██╔═══╝ ██║   ██║██║     ██║
 ██║     ██║███████╗███████╗██████╔╝██║     ╚██████╔╝███████╗███████╗
 ╚═╝     ╚═╝╚══════╝╚══════╝╚═════╝ ╚═╝      ╚═════╝ ╚══════╝╚══════╝
    "#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Options coming from the command line that affect logging
#[derive(Debug, Clone, Default)]
pub struct LoggingOverrides {
    /// `--log-level` value
    pub level: Option<String>,
    /// `--json-logs`
    pub json: bool,
    /// `--no-color`
    pub no_color: bool,
    /// Skip the log file entirely (one-shot CLI commands)
    pub console_only: bool,
}

/// Initialize logging for a service
///
/// Log root directory priority:
/// 1. FIELDPOLL_LOG_DIR environment variable
/// 2. `logging_config.dir` from the service configuration file
/// 3. Default "logs"
pub fn init_logging(
    service: &ServiceInfo,
    logging_config: Option<&LoggingConfig>,
    overrides: &LoggingOverrides,
) -> FieldResult<()> {
    let config_dir = logging_config.and_then(|c| c.dir.as_deref());
    logging::init_log_root(config_dir);

    // CLI level wins over the file; a bare level also sets the console level
    let filter = overrides
        .level
        .clone()
        .or_else(|| logging_config.and_then(|c| c.level.clone()));
    let console_level = filter
        .as_deref()
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let filter = filter.filter(|s| s.parse::<Level>().is_err());

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root().join(&service.name),
        console_level,
        filter,
        enable_json: overrides.json || logging_config.map(|c| c.json).unwrap_or(false),
        ansi: !overrides.no_color,
        max_log_files: logging_config.and_then(|c| c.max_files).unwrap_or(30),
        enable_file: !overrides.console_only,
    };

    logging::init_with_config(log_config)
        .map_err(|e| FieldError::StartupFailed(format!("Failed to init logging: {}", e)))
}
