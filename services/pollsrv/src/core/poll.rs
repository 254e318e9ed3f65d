//! Poll cycle engine
//!
//! One cycle connects if needed, then reads entities strictly in
//! configuration order. Per-entity failures only drop that entity from the
//! result; `failure_threshold` back-to-back failures are taken as a dead
//! transport, which is disconnected and the rest of the cycle abandoned.

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::core::client::{ReadRequest, TransportClient};
use crate::core::codec;
use crate::core::entity::{Address, EntityConfig, EntityTarget, ModbusPoint, RegisterKind};
use crate::core::format;
use crate::core::types::{PointValue, PollResult, ProtocolValue, RawValue};

/// Consecutive entity failures that abort a cycle
pub const DEFAULT_FAILURE_THRESHOLD: usize = 2;

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every readable entity was attempted
    Completed,
    /// The transport could not be connected; nothing was attempted
    NotConnected,
    /// Too many consecutive failures; the transport was disconnected
    Aborted,
}

/// Result of one cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub values: PollResult,
    pub outcome: CycleOutcome,
    pub attempted: usize,
    pub failures: usize,
}

impl CycleReport {
    fn not_connected() -> Self {
        Self {
            values: PollResult::new(),
            outcome: CycleOutcome::NotConnected,
            attempted: 0,
            failures: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CycleOutcome::Completed
    }
}

/// Cycle driver. Holds the per-address cache of auto-detected register kinds.
#[derive(Debug)]
pub struct PollEngine {
    failure_threshold: usize,
    detected: DashMap<u16, RegisterKind>,
}

impl Default for PollEngine {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl PollEngine {
    pub fn new(failure_threshold: usize) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            detected: DashMap::new(),
        }
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Register kind detected for an `auto` address, if any
    pub fn detected_kind(&self, address: u16) -> Option<RegisterKind> {
        self.detected.get(&address).map(|k| *k.value())
    }

    /// Connect if needed, subscribing the client to `entities` on a fresh link
    pub async fn ensure_connected<C>(&self, client: &mut C, entities: &[EntityConfig]) -> bool
    where
        C: TransportClient + ?Sized,
    {
        if client.is_connected() {
            return true;
        }
        if !client.connect().await {
            return false;
        }
        let addresses: Vec<Address> = entities
            .iter()
            .filter(|e| e.rw.can_read())
            .map(EntityConfig::address)
            .collect();
        client.prime(&addresses).await;
        true
    }

    /// Run one cycle over `entities`
    pub async fn run_cycle<C>(&self, client: &mut C, entities: &[EntityConfig]) -> CycleReport
    where
        C: TransportClient + ?Sized,
    {
        if !self.ensure_connected(client, entities).await {
            error!("Connect to {} failed, skipping cycle", client.endpoint());
            return CycleReport::not_connected();
        }

        let mut report = CycleReport {
            values: PollResult::with_capacity(entities.len()),
            outcome: CycleOutcome::Completed,
            attempted: 0,
            failures: 0,
        };
        let mut consecutive = 0;

        for entity in entities.iter().filter(|e| e.rw.can_read()) {
            report.attempted += 1;
            match self.poll_entity(client, entity).await {
                Some(value) => {
                    consecutive = 0;
                    report.values.insert(entity.key.clone(), value);
                },
                None => {
                    report.failures += 1;
                    consecutive += 1;
                    if consecutive >= self.failure_threshold {
                        error!(
                            "{} consecutive failures on {}, disconnecting and aborting cycle",
                            consecutive,
                            client.endpoint()
                        );
                        client.disconnect().await;
                        report.outcome = CycleOutcome::Aborted;
                        break;
                    }
                },
            }
        }

        debug!(
            "Cycle on {}: {}/{} ok ({:?})",
            client.endpoint(),
            report.values.len(),
            report.attempted,
            report.outcome
        );
        report
    }

    /// Read, decode and render one entity. `None` on any failure (logged).
    pub async fn poll_entity<C>(&self, client: &mut C, entity: &EntityConfig) -> Option<PointValue>
    where
        C: TransportClient + ?Sized,
    {
        let (raw, _) = self.read_raw(client, entity).await?;
        match codec::decode(&raw, entity) {
            Ok(value) => {
                debug!("{} @ {} = {}", entity.name, entity.address(), value);
                Some(render(entity, value))
            },
            Err(e) => {
                warn!(
                    "Decode failed for '{}' at {}: {}",
                    entity.name,
                    entity.address(),
                    e
                );
                None
            },
        }
    }

    /// Fetch the undecoded value, resolving `auto` register kinds
    pub async fn read_raw<C>(
        &self,
        client: &mut C,
        entity: &EntityConfig,
    ) -> Option<(RawValue, Option<RegisterKind>)>
    where
        C: TransportClient + ?Sized,
    {
        let address = entity.address();
        let result = match &entity.target {
            EntityTarget::Modbus(point) => self.read_modbus(client, &address, point).await,
            EntityTarget::Snmp(point) => {
                let request = ReadRequest {
                    walk: point.walk,
                    ..Default::default()
                };
                client.read(&address, &request).await.map(|raw| (raw, None))
            },
            EntityTarget::Mqtt(point) => {
                let request = ReadRequest {
                    wait: Some(point.wait),
                    ..Default::default()
                };
                client.read(&address, &request).await.map(|raw| (raw, None))
            },
        };
        if result.is_none() {
            warn!("Read failed for '{}' at {}", entity.name, address);
        }
        result
    }

    async fn read_modbus<C>(
        &self,
        client: &mut C,
        address: &Address,
        point: &ModbusPoint,
    ) -> Option<(RawValue, Option<RegisterKind>)>
    where
        C: TransportClient + ?Sized,
    {
        let count = point.read_count();
        let request = |kind| ReadRequest {
            slave_id: point.slave_id,
            ..ReadRequest::registers(kind, count)
        };
        if let Some(kind) = point.register_type.fixed() {
            let raw = client.read(address, &request(kind)).await?;
            return Some((raw, Some(kind)));
        }

        for kind in self.detect_order(point.address) {
            let Some(raw) = client.read(address, &request(kind)).await else {
                continue;
            };
            if raw.size() != usize::from(count) {
                debug!(
                    "Auto-detect {} at {}: got {} elements, want {}",
                    kind,
                    point.address,
                    raw.size(),
                    count
                );
                continue;
            }
            if self.detected.insert(point.address, kind) != Some(kind) {
                debug!("Auto-detected {} register at {}", kind, point.address);
            }
            return Some((raw, Some(kind)));
        }
        self.detected.remove(&point.address);
        None
    }

    /// Trial order for an `auto` address: a cached kind first, then the rest
    fn detect_order(&self, address: u16) -> Vec<RegisterKind> {
        let cached = self.detected_kind(address);
        cached
            .into_iter()
            .chain(
                RegisterKind::DETECT_ORDER
                    .into_iter()
                    .filter(|k| Some(*k) != cached),
            )
            .collect()
    }

    /// Kind to write an `auto` entity with: cached, else detected by a read
    pub async fn resolve_write_kind<C>(
        &self,
        client: &mut C,
        entity: &EntityConfig,
    ) -> Option<RegisterKind>
    where
        C: TransportClient + ?Sized,
    {
        let EntityTarget::Modbus(point) = &entity.target else {
            return None;
        };
        if let Some(kind) = point.register_type.fixed() {
            return Some(kind);
        }
        if let Some(kind) = self.detected_kind(point.address) {
            return Some(kind);
        }
        match self.read_raw(client, entity).await {
            Some((_, kind)) => kind,
            None => Some(RegisterKind::Holding),
        }
    }
}

/// Attach the display form: an option label wins over a format template
pub fn render(entity: &EntityConfig, value: ProtocolValue) -> PointValue {
    let display = entity
        .display_option(&value.to_string())
        .map(str::to_string)
        .or_else(|| entity.format.as_deref().map(|f| format::apply(f, &value)));
    PointValue { value, display }
}
