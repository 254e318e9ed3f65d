//! Field Device Polling Service (pollsrv)
//!
//! Runs the polling loop for every configured device, or performs a single
//! validate / poll / read / write and exits.

use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use errors::{FieldError, FieldResult};
use pollsrv::core::bootstrap::{self, Args, Command};
use pollsrv::core::entity::RwMode;
use pollsrv::core::types::ProtocolValue;
use pollsrv::{AppConfig, PollSrvError, Runtime};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pollsrv: [{}] {e}", e.error_code());
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        },
    }
}

async fn run(args: Args) -> FieldResult<()> {
    let service = bootstrap::service_info();

    // Logging comes up before config errors are reported so they reach the log
    let loaded = AppConfig::load(&args.config);
    bootstrap::initialize_logging(&args, &service, loaded.as_ref().ok().map(|c| &c.logging))?;
    let config = loaded?;

    match args.command() {
        Command::Run => {
            if !args.no_color {
                common::service_bootstrap::print_startup_banner(&service);
            }
            serve(&config).await
        },
        Command::Validate => validate(&config),
        Command::Poll { device } => poll_once(&config, &device).await,
        Command::Read {
            device,
            entity,
            raw,
            overrides,
        } => {
            let overrides = overrides.to_overrides(raw)?;
            let runtime = Runtime::build(&config)?;
            let coordinator = runtime.coordinator(&device)?;
            let result = coordinator.try_read_entity(&entity, &overrides).await;
            runtime.shutdown().await;
            match result? {
                Some(output) => print_json(&output),
                None => Err(FieldError::Protocol {
                    protocol: coordinator.protocol().to_string(),
                    message: format!("no data for '{entity}' on '{device}'"),
                }),
            }
        },
        Command::Write {
            device,
            entity,
            value,
            option,
            overrides,
        } => {
            let overrides = overrides.to_overrides(false)?;
            let runtime = Runtime::build(&config)?;
            let coordinator = runtime.coordinator(&device)?;
            let result = match (option, value) {
                (Some(label), _) => coordinator.try_write_option(&entity, &label).await,
                (None, Some(text)) => {
                    let value = ProtocolValue::parse_literal(&text);
                    coordinator.try_write_entity(&entity, &value, &overrides).await
                },
                (None, None) => Err(PollSrvError::config("either --value or --option is required")),
            };
            runtime.shutdown().await;
            if result? {
                println!("ok");
                Ok(())
            } else {
                Err(FieldError::Protocol {
                    protocol: coordinator.protocol().to_string(),
                    message: format!("write to '{entity}' on '{device}' was not acknowledged"),
                })
            }
        },
    }
}

/// Poll until SIGINT/SIGTERM
async fn serve(config: &AppConfig) -> FieldResult<()> {
    let runtime = Runtime::build(config)?;
    let cancel = CancellationToken::new();

    let polling = {
        let cancel = cancel.clone();
        async move {
            runtime.run(cancel).await;
            runtime
        }
    };
    let shutdown = async {
        common::shutdown::wait_for_shutdown().await;
        info!("Shutdown signal received");
        cancel.cancel();
    };

    let (runtime, ()) = tokio::join!(polling, shutdown);
    runtime.shutdown().await;
    info!("pollsrv stopped");
    Ok(())
}

async fn poll_once(config: &AppConfig, device: &str) -> FieldResult<()> {
    let runtime = Runtime::build(config)?;
    let coordinator = runtime.coordinator(device)?;
    let snapshot = coordinator.refresh_now().await;
    runtime.shutdown().await;
    print_json(&snapshot)?;
    if snapshot.last_update_success {
        Ok(())
    } else {
        Err(FieldError::Protocol {
            protocol: coordinator.protocol().to_string(),
            message: format!("poll cycle for '{device}' did not complete"),
        })
    }
}

#[derive(Serialize)]
struct DeviceSummary {
    name: String,
    protocol: String,
    connection: String,
    interval_secs: u64,
    timeout_secs: f64,
    entities: Vec<EntitySummary>,
}

#[derive(Serialize)]
struct EntitySummary {
    key: String,
    address: String,
    rw: RwMode,
}

fn validate(config: &AppConfig) -> FieldResult<()> {
    let mut devices = Vec::with_capacity(config.devices.len());
    for device in &config.devices {
        let entities = device
            .entities()?
            .into_iter()
            .map(|e| EntitySummary {
                address: e.address().to_string(),
                rw: e.rw,
                key: e.key,
            })
            .collect();
        devices.push(DeviceSummary {
            name: device.name.clone(),
            protocol: device.protocol().to_string(),
            connection: device.connection.key().to_string(),
            interval_secs: device.interval().as_secs(),
            timeout_secs: device.timeout_or(config.default_timeout()).as_secs_f64(),
            entities,
        });
    }
    let text = serde_yaml::to_string(&devices)?;
    print!("{text}");
    info!("Configuration is valid: {} device(s)", devices.len());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> FieldResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{text}");
    Ok(())
}
