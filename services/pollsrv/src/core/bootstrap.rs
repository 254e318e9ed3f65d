//! Command line and logging bootstrap

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use common::service_bootstrap::{LoggingOverrides, ServiceInfo};
use common::LoggingConfig;
use errors::FieldResult;

use crate::core::config::DEFAULT_CONFIG_PATH;
use crate::core::entity::{EntityOverrides, Order, RegisterType};
use crate::error::Result;

/// Command-line arguments for pollsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pollsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Multi-protocol field device polling service",
    long_about = None
)]
pub struct Args {
    /// Configuration file
    #[arg(short = 'c', long, env = "POLLSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Write JSON log lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Poll every configured device until shutdown (default)
    Run,
    /// Load and validate the configuration, then print a summary
    Validate,
    /// Run a single poll cycle on one device and print the snapshot
    Poll {
        #[arg(short, long)]
        device: String,
    },
    /// Read one entity
    Read {
        #[arg(short, long)]
        device: String,
        /// Entity key or name
        #[arg(short, long)]
        entity: String,
        /// Print the undecoded wire value with metadata
        #[arg(long)]
        raw: bool,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Write one entity
    Write {
        #[arg(short, long)]
        device: String,
        /// Entity key or name
        #[arg(short, long)]
        entity: String,
        /// Value literal (number, true/false, JSON or text)
        #[arg(long, required_unless_present = "option", conflicts_with = "option")]
        value: Option<String>,
        /// Option label to write through the entity's options map
        #[arg(long)]
        option: Option<String>,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
}

/// One-off overrides for read and write
#[derive(clap::Args, Debug, Clone, Default, PartialEq)]
pub struct OverrideArgs {
    #[arg(long)]
    pub data_type: Option<String>,
    #[arg(long)]
    pub byte_order: Option<String>,
    #[arg(long)]
    pub word_order: Option<String>,
    #[arg(long)]
    pub register_type: Option<String>,
    #[arg(long)]
    pub scale: Option<f64>,
    #[arg(long)]
    pub offset: Option<f64>,
    /// Element count (registers or bits)
    #[arg(long)]
    pub count: Option<u16>,
}

impl OverrideArgs {
    pub fn to_overrides(&self, raw: bool) -> Result<EntityOverrides> {
        Ok(EntityOverrides {
            data_type: self.data_type.clone(),
            byte_order: self.byte_order.as_deref().map(str::parse::<Order>).transpose()?,
            word_order: self.word_order.as_deref().map(str::parse::<Order>).transpose()?,
            register_type: self
                .register_type
                .as_deref()
                .map(str::parse::<RegisterType>)
                .transpose()?,
            scale: self.scale,
            offset: self.offset,
            count: self.count,
            raw,
        })
    }
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// One-shot commands log to the console only
    pub fn logging_overrides(&self) -> LoggingOverrides {
        LoggingOverrides {
            level: self.log_level.clone(),
            json: self.json_logs,
            no_color: self.no_color,
            console_only: self.command() != Command::Run,
        }
    }
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "pollsrv",
        env!("CARGO_PKG_VERSION"),
        "Field Device Polling Service - Modbus / SNMP / MQTT",
    )
}

/// Initialize logging from CLI flags and the `logging` config section
///
/// Log root directory priority:
/// 1. FIELDPOLL_LOG_DIR environment variable
/// 2. `logging.dir` from the configuration file
/// 3. Default "logs"
pub fn initialize_logging(
    args: &Args,
    service: &ServiceInfo,
    logging_config: Option<&LoggingConfig>,
) -> FieldResult<()> {
    common::service_bootstrap::init_logging(service, logging_config, &args.logging_overrides())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let args = Args::try_parse_from(["pollsrv"]).unwrap();
        assert_eq!(args.command(), Command::Run);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!args.logging_overrides().console_only);
    }

    #[test]
    fn test_read_with_overrides() {
        let args = Args::try_parse_from([
            "pollsrv",
            "-l",
            "debug",
            "read",
            "--device",
            "boiler",
            "--entity",
            "supply_temp",
            "--raw",
            "--data-type",
            "int32",
            "--word-order",
            "little",
            "--count",
            "2",
        ])
        .unwrap();
        let Command::Read {
            device,
            raw,
            overrides,
            ..
        } = args.command()
        else {
            panic!("expected read");
        };
        assert_eq!(device, "boiler");
        let overrides = overrides.to_overrides(raw).unwrap();
        assert!(overrides.raw);
        assert_eq!(overrides.word_order, Some(Order::Little));
        assert_eq!(overrides.count, Some(2));
        assert!(args.logging_overrides().console_only);
        assert_eq!(args.logging_overrides().level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_write_needs_value_or_option() {
        assert!(Args::try_parse_from(["pollsrv", "write", "-d", "b", "-e", "mode"]).is_err());
        assert!(Args::try_parse_from([
            "pollsrv", "write", "-d", "b", "-e", "mode", "--value", "1", "--option", "Heat"
        ])
        .is_err());
        assert!(
            Args::try_parse_from(["pollsrv", "write", "-d", "b", "-e", "mode", "--option", "Heat"])
                .is_ok()
        );
    }

    #[test]
    fn test_bad_override_rejected() {
        let overrides = OverrideArgs {
            byte_order: Some("middle".into()),
            ..Default::default()
        };
        assert!(overrides.to_overrides(false).is_err());
    }
}
