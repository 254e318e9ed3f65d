//! Device coordinator
//!
//! Binds one shared transport client, the device's entity list and a poll
//! engine. All wire traffic (scheduled cycles and on-demand reads/writes)
//! runs under the client's lock, so the two never interleave. A scheduled
//! trigger that finds the lock taken is skipped, not queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::client::{TransportClient, WriteRequest};
use crate::core::codec;
use crate::core::config::DeviceConfig;
use crate::core::connection_pool::SharedClient;
use crate::core::entity::{entity_key, EntityConfig, EntityOverrides, EntityTarget};
use crate::core::poll::{render, CycleOutcome, PollEngine};
use crate::core::registry::Protocol;
use crate::core::types::{ConnectionState, PointValue, PollResult, ProtocolValue};
use crate::error::{PollSrvError, Result};

/// Latest published poll result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub values: PollResult,
    pub last_update_success: bool,
    /// Client state when the cycle finished
    pub connection: ConnectionState,
    pub updated_at: Option<DateTime<Utc>>,
    /// Completed cycles since start
    pub cycle: u64,
}

/// Output of an on-demand read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadOutput {
    Value(PointValue),
    /// Undecoded wire value plus metadata
    Raw(serde_json::Value),
}

pub struct Coordinator {
    name: String,
    protocol: Protocol,
    client: SharedClient,
    entities: Vec<EntityConfig>,
    engine: PollEngine,
    interval: Duration,
    cycles: AtomicU64,
    snapshot: watch::Sender<Snapshot>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("entities", &self.entities.len())
            .field("interval", &self.interval)
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        client: SharedClient,
        entities: Vec<EntityConfig>,
        interval: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            name: name.into(),
            protocol,
            client,
            entities,
            engine: PollEngine::default(),
            interval,
            cycles: AtomicU64::new(0),
            snapshot,
        }
    }

    /// Build from a device section with an already acquired client
    pub fn from_device(device: &DeviceConfig, client: SharedClient) -> Result<Self> {
        Ok(Self::new(
            device.name.clone(),
            device.protocol(),
            client,
            device.entities()?,
            device.interval(),
        ))
    }

    /// Replace the default poll engine (e.g. a different failure threshold)
    pub fn with_engine(mut self, engine: PollEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn entities(&self) -> &[EntityConfig] {
        &self.entities
    }

    pub fn engine(&self) -> &PollEngine {
        &self.engine
    }

    /// Look up an entity by key or by display name
    pub fn entity(&self, selector: &str) -> Option<&EntityConfig> {
        let key = entity_key(selector);
        self.entities
            .iter()
            .find(|e| e.key == key || e.name == selector)
    }

    fn require_entity(&self, selector: &str) -> Result<&EntityConfig> {
        self.entity(selector).ok_or_else(|| {
            PollSrvError::not_found(format!("entity '{}' on device '{}'", selector, self.name))
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Connection status; waits for any in-flight operation
    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_connected()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        ConnectionState::from(self.is_connected().await)
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    /// Scheduled entry point. Returns `false` when skipped because busy.
    pub async fn refresh(&self) -> bool {
        let Ok(mut client) = self.client.try_lock() else {
            debug!("{}: client busy, skipping scheduled refresh", self.name);
            return false;
        };
        self.cycle_locked(&mut **client).await;
        true
    }

    /// Run a cycle now, waiting for the client if necessary
    pub async fn refresh_now(&self) -> Snapshot {
        let mut client = self.client.lock().await;
        self.cycle_locked(&mut **client).await
    }

    async fn cycle_locked(&self, client: &mut dyn TransportClient) -> Snapshot {
        let report = self.engine.run_cycle(client, &self.entities).await;
        let success = report.outcome == CycleOutcome::Completed;
        if !success {
            warn!(
                "{}: cycle ended {:?} with {}/{} values",
                self.name,
                report.outcome,
                report.values.len(),
                report.attempted
            );
        }
        let snapshot = Snapshot {
            values: report.values,
            last_update_success: success,
            connection: ConnectionState::from(client.is_connected()),
            updated_at: Some(Utc::now()),
            cycle: self.cycles.fetch_add(1, Ordering::Relaxed) + 1,
        };
        self.snapshot.send_replace(snapshot.clone());
        snapshot
    }

    /// Spawn the periodic polling task
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(cancel).await })
    }

    /// Poll every `interval` until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "{}: polling {} entities every {:?} ({})",
            self.name,
            self.entities.len(),
            self.interval,
            self.protocol
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
        info!("{}: polling stopped", self.name);
    }

    // ------------------------------------------------------------------------
    // On-demand operations
    // ------------------------------------------------------------------------

    /// Single-entity read; every failure is logged and becomes `None`
    pub async fn read_entity(&self, selector: &str, overrides: &EntityOverrides) -> Option<ReadOutput> {
        match self.try_read_entity(selector, overrides).await {
            Ok(output) => output,
            Err(e) => {
                warn!("{}: read '{}' rejected: {}", self.name, selector, e);
                None
            },
        }
    }

    /// Single-entity read. `Err` only for lookup or override problems;
    /// wire and decode failures are `Ok(None)`.
    pub async fn try_read_entity(
        &self,
        selector: &str,
        overrides: &EntityOverrides,
    ) -> Result<Option<ReadOutput>> {
        let entity = self.require_entity(selector)?.with_overrides(overrides)?;

        let mut client = self.client.lock().await;
        if !self.engine.ensure_connected(&mut **client, &self.entities).await {
            warn!("{}: not connected, read of '{}' skipped", self.name, entity.name);
            return Ok(None);
        }
        let Some((raw, kind)) = self.engine.read_raw(&mut **client, &entity).await else {
            return Ok(None);
        };
        drop(client);

        if overrides.raw {
            return Ok(Some(ReadOutput::Raw(codec::raw_report(&raw, &entity, kind))));
        }
        match codec::decode(&raw, &entity) {
            Ok(value) => Ok(Some(ReadOutput::Value(render(&entity, value)))),
            Err(e) => {
                warn!(
                    "{}: decode failed for '{}' at {}: {}",
                    self.name,
                    entity.name,
                    entity.address(),
                    e
                );
                Ok(None)
            },
        }
    }

    /// Single-entity write; `true` iff the device acknowledged
    pub async fn write_entity(
        &self,
        selector: &str,
        value: &ProtocolValue,
        overrides: &EntityOverrides,
    ) -> bool {
        match self.try_write_entity(selector, value, overrides).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("{}: write '{}' rejected: {}", self.name, selector, e);
                false
            },
        }
    }

    /// Single-entity write. Contract violations (read-only entity, read-only
    /// register kind, walk target) are `Err` and happen before any wire I/O.
    pub async fn try_write_entity(
        &self,
        selector: &str,
        value: &ProtocolValue,
        overrides: &EntityOverrides,
    ) -> Result<bool> {
        let entity = self.require_entity(selector)?.with_overrides(overrides)?;
        check_writable(&entity)?;

        let mut client = self.client.lock().await;
        if !self.engine.ensure_connected(&mut **client, &self.entities).await {
            warn!("{}: not connected, write of '{}' skipped", self.name, entity.name);
            return Ok(false);
        }
        let kind = self.engine.resolve_write_kind(&mut **client, &entity).await;

        let raw = match codec::encode(value, &entity, kind) {
            Ok(raw) => raw,
            Err(e) if e.is_contract_violation() => return Err(e),
            Err(e) => {
                warn!(
                    "{}: encode failed for '{}' at {}: {}",
                    self.name,
                    entity.name,
                    entity.address(),
                    e
                );
                return Ok(false);
            },
        };

        let request = match &entity.target {
            EntityTarget::Mqtt(point) => WriteRequest {
                kind,
                qos: point.qos,
                retain: point.retain,
                ..Default::default()
            },
            EntityTarget::Modbus(point) => WriteRequest {
                kind,
                slave_id: point.slave_id,
                ..Default::default()
            },
            EntityTarget::Snmp(_) => WriteRequest::default(),
        };
        let ok = client.write(&entity.address(), &raw, &request).await;
        if ok {
            info!("{}: wrote {} to '{}'", self.name, value, entity.name);
        } else {
            warn!(
                "{}: write to '{}' at {} not acknowledged",
                self.name,
                entity.name,
                entity.address()
            );
        }
        Ok(ok)
    }

    /// Write the raw value mapped to a display `label` through the entity's options
    pub async fn write_option(&self, selector: &str, label: &str) -> bool {
        match self.try_write_option(selector, label).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("{}: option write to '{}' rejected: {}", self.name, selector, e);
                false
            },
        }
    }

    /// Like [`write_option`](Self::write_option) but unknown labels and
    /// contract violations come back as errors
    pub async fn try_write_option(&self, selector: &str, label: &str) -> Result<bool> {
        let entity = self.require_entity(selector)?;
        let raw = entity.option_value(label).ok_or_else(|| {
            PollSrvError::not_found(format!("option '{}' of '{}'", label, entity.name))
        })?;
        let value = ProtocolValue::parse_literal(raw);
        self.try_write_entity(selector, &value, &EntityOverrides::default())
            .await
    }
}

/// Reject writes that are invalid regardless of value
fn check_writable(entity: &EntityConfig) -> Result<()> {
    if !entity.rw.can_write() {
        return Err(PollSrvError::ReadOnlyEntity(entity.name.clone()));
    }
    match &entity.target {
        EntityTarget::Modbus(point) => match point.register_type.fixed() {
            Some(kind) if !kind.is_writable() => Err(PollSrvError::ReadOnlyRegister {
                kind: kind.to_string(),
                address: point.address,
            }),
            _ => Ok(()),
        },
        EntityTarget::Snmp(point) if point.walk => Err(PollSrvError::ReadOnlyTarget(point.oid.clone())),
        _ => Ok(()),
    }
}
