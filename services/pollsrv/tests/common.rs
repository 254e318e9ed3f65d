//! Test Common Utilities
//!
//! Scripted transport client with call counters and entity builders shared
//! by the pollsrv integration tests.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use pollsrv::core::client::{ReadRequest, TransportClient, WriteRequest};
use pollsrv::core::connection_pool::SharedClient;
use pollsrv::core::entity::{
    Address, EntityConfig, EntityTarget, ModbusDataType, ModbusPoint, Order, RegisterKind,
    RegisterType, RwMode, SnmpDataType, SnmpPoint,
};
use pollsrv::core::registry::Protocol;
use pollsrv::core::types::RawValue;

/// Observable side of a [`MockClient`], kept after the client is boxed
#[derive(Default)]
pub struct MockState {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub read_log: Mutex<Vec<(Address, ReadRequest)>>,
    pub write_log: Mutex<Vec<(Address, RawValue, WriteRequest)>>,
    pub primed: Mutex<Vec<Address>>,
}

impl MockState {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Total wire operations of any kind
    pub fn wire_ops(&self) -> usize {
        self.connects() + self.reads() + self.writes()
    }

    /// Register kinds requested for `address`, in order
    pub fn kinds_read(&self, address: u16) -> Vec<RegisterKind> {
        self.read_log
            .lock()
            .iter()
            .filter(|(a, _)| *a == Address::Register(address))
            .filter_map(|(_, r)| r.kind)
            .collect()
    }
}

/// Transport client answering from a scripted table
///
/// A response registered with a kind only answers reads of that kind; one
/// registered without a kind answers any read of the address.
pub struct MockClient {
    protocol: Protocol,
    state: Arc<MockState>,
    responses: HashMap<(Address, Option<RegisterKind>), RawValue>,
    connected: bool,
    refuse_connect: bool,
    nack: HashSet<Address>,
}

impl MockClient {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: Arc::new(MockState::default()),
            responses: HashMap::new(),
            connected: false,
            refuse_connect: false,
            nack: HashSet::new(),
        }
    }

    pub fn modbus() -> Self {
        Self::new(Protocol::Modbus)
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }

    pub fn respond(mut self, address: Address, kind: Option<RegisterKind>, raw: RawValue) -> Self {
        self.responses.insert((address, kind), raw);
        self
    }

    /// Answer holding-register reads at `address`
    pub fn holding(self, address: u16, words: &[u16]) -> Self {
        self.respond(
            Address::Register(address),
            Some(RegisterKind::Holding),
            RawValue::Registers(words.to_vec()),
        )
    }

    pub fn coils(self, address: u16, bits: &[bool]) -> Self {
        self.respond(
            Address::Register(address),
            Some(RegisterKind::Coil),
            RawValue::Bits(bits.to_vec()),
        )
    }

    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Writes to `address` are not acknowledged
    pub fn nack_writes(mut self, address: Address) -> Self {
        self.nack.insert(address);
        self
    }

    pub fn shared(self) -> (SharedClient, Arc<MockState>) {
        let state = self.state();
        let boxed: Box<dyn TransportClient> = Box::new(self);
        (Arc::new(tokio::sync::Mutex::new(boxed)), state)
    }
}

#[async_trait]
impl TransportClient for MockClient {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn endpoint(&self) -> String {
        "mock://device".to_string()
    }

    async fn connect(&mut self) -> bool {
        if self.connected {
            return true;
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = !self.refuse_connect;
        self.connected
    }

    async fn disconnect(&mut self) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read(&mut self, address: &Address, request: &ReadRequest) -> Option<RawValue> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        self.state
            .read_log
            .lock()
            .push((address.clone(), request.clone()));
        if !self.connected {
            return None;
        }
        self.responses
            .get(&(address.clone(), request.kind))
            .or_else(|| self.responses.get(&(address.clone(), None)))
            .cloned()
    }

    async fn write(&mut self, address: &Address, value: &RawValue, request: &WriteRequest) -> bool {
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        self.state
            .write_log
            .lock()
            .push((address.clone(), value.clone(), request.clone()));
        self.connected && !self.nack.contains(address)
    }

    async fn prime(&mut self, addresses: &[Address]) {
        self.state.primed.lock().extend_from_slice(addresses);
    }
}

// ============================================================================
// Entity builders
// ============================================================================

pub fn modbus_entity(
    name: &str,
    address: u16,
    data_type: ModbusDataType,
    register_type: RegisterType,
) -> EntityConfig {
    EntityConfig::new(
        name,
        EntityTarget::Modbus(ModbusPoint {
            address,
            data_type,
            register_type,
            byte_order: Order::Big,
            word_order: Order::Big,
            count: None,
            slave_id: None,
        }),
    )
}

/// `uint16` holding register
pub fn holding_u16(name: &str, address: u16) -> EntityConfig {
    modbus_entity(name, address, ModbusDataType::Uint16, RegisterType::Holding)
}

pub fn writable(mut entity: EntityConfig) -> EntityConfig {
    entity.rw = RwMode::Rw;
    entity
}

pub fn scaled(mut entity: EntityConfig, scale: f64, offset: f64) -> EntityConfig {
    entity.scale = scale;
    entity.offset = offset;
    entity
}

pub fn snmp_entity(name: &str, oid: &str, data_type: SnmpDataType, walk: bool) -> EntityConfig {
    EntityConfig::new(
        name,
        EntityTarget::Snmp(SnmpPoint {
            oid: oid.to_string(),
            data_type,
            walk,
        }),
    )
}
