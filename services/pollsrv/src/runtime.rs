//! Service runtime
//!
//! Builds one coordinator per configured device over a shared connection
//! pool, runs their polling tasks and tears everything down on shutdown.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::{AppConfig, ConnectionKey};
use crate::core::connection_pool::ConnectionPool;
use crate::core::coordinator::Coordinator;
use crate::core::registry::build_client;
use crate::error::{PollSrvError, Result};

pub struct Runtime {
    pool: Arc<ConnectionPool>,
    devices: Vec<(ConnectionKey, Arc<Coordinator>)>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("devices", &self.devices.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Runtime {
    pub fn build(config: &AppConfig) -> Result<Self> {
        Self::with_pool(config, Arc::new(ConnectionPool::new()))
    }

    /// Build coordinators, acquiring clients from `pool`
    pub fn with_pool(config: &AppConfig, pool: Arc<ConnectionPool>) -> Result<Self> {
        let default_timeout = config.default_timeout();
        let mut devices = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            let key = device.connection.key();
            let timeout = device.timeout_or(default_timeout);
            let client = pool.acquire(&key, || build_client(&device.connection, timeout))?;
            let coordinator = Coordinator::from_device(device, client)?;
            debug!("Device '{}' on {}", device.name, key);
            devices.push((key, Arc::new(coordinator)));
        }
        info!(
            "{} device(s) over {} connection(s)",
            devices.len(),
            pool.len()
        );
        Ok(Self { pool, devices })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &Arc<Coordinator>> {
        self.devices.iter().map(|(_, c)| c)
    }

    pub fn coordinator(&self, name: &str) -> Result<Arc<Coordinator>> {
        self.coordinators()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| PollSrvError::not_found(format!("device '{name}'")))
    }

    /// Poll all devices until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(self.devices.len() * 2);
        for coordinator in self.coordinators() {
            handles.push(coordinator.spawn(cancel.child_token()));
            handles.push(spawn_snapshot_logger(coordinator, cancel.child_token()));
        }
        cancel.cancelled().await;
        for result in join_all(handles).await {
            if let Err(e) = result {
                debug!("Task ended abnormally: {}", e);
            }
        }
    }

    /// Release every device's connection
    pub async fn shutdown(&self) {
        for (key, coordinator) in &self.devices {
            debug!("Releasing {} for '{}'", key, coordinator.name());
            self.pool.release(key).await;
        }
        info!("All connections released");
    }
}

fn spawn_snapshot_logger(
    coordinator: &Arc<Coordinator>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let name = coordinator.name().to_string();
    let mut rx = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let (count, ok, cycle) = {
                        let snapshot = rx.borrow_and_update();
                        (snapshot.values.len(), snapshot.last_update_success, snapshot.cycle)
                    };
                    debug!("{}: cycle {} published {} value(s), success={}", name, cycle, count, ok);
                }
            }
        }
    })
}
