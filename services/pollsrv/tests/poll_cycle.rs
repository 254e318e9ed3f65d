//! Poll cycle and coordinator behaviour against a scripted transport

#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tracing_test::traced_test;

use common::{holding_u16, modbus_entity, scaled, snmp_entity, writable, MockClient};
use pollsrv::core::coordinator::{Coordinator, ReadOutput};
use pollsrv::core::entity::{
    Address, EntityOverrides, ModbusDataType, RegisterKind, RegisterType, SnmpDataType,
};
use pollsrv::core::poll::{CycleOutcome, PollEngine};
use pollsrv::core::registry::Protocol;
use pollsrv::core::types::{ConnectionState, ProtocolValue, RawValue};
use pollsrv::PollSrvError;

const INTERVAL: Duration = Duration::from_secs(10);

/// Mock answering holding registers 0..n except `failing`
fn device_with_gaps(n: u16, failing: &[u16]) -> MockClient {
    (0..n)
        .filter(|a| !failing.contains(a))
        .fold(MockClient::modbus(), |mock, a| mock.holding(a, &[a * 10]))
}

fn entities(n: u16) -> Vec<pollsrv::EntityConfig> {
    (0..n).map(|a| holding_u16(&format!("Reg {a}"), a)).collect()
}

// ============================================================================
// Engine
// ============================================================================

#[tokio::test]
#[traced_test]
async fn test_consecutive_failures_abort_cycle() {
    let mut client = device_with_gaps(8, &[3, 4]);
    let state = client.state();
    let engine = PollEngine::new(2);

    let report = engine.run_cycle(&mut client, &entities(8)).await;

    assert_eq!(report.outcome, CycleOutcome::Aborted);
    assert_eq!(report.attempted, 5);
    assert_eq!(report.values.len(), 3);
    assert!(!report.values.contains_key("reg_5"));
    assert_eq!(state.disconnects(), 1);
    assert_eq!(state.reads(), 5);
    assert!(state.kinds_read(5).is_empty());
    assert!(logs_contain("consecutive failures"));
}

#[tokio::test]
async fn test_isolated_failure_completes_cycle() {
    let mut client = device_with_gaps(10, &[4]);
    let state = client.state();
    let engine = PollEngine::default();

    let report = engine.run_cycle(&mut client, &entities(10)).await;

    assert!(report.is_success());
    assert_eq!(report.attempted, 10);
    assert_eq!(report.failures, 1);
    assert_eq!(report.values.len(), 9);
    assert!(!report.values.contains_key("reg_4"));
    assert_eq!(report.values["reg_9"].value, ProtocolValue::Integer(90));
    assert_eq!(state.disconnects(), 0);
}

#[tokio::test]
async fn test_failures_separated_by_success_do_not_abort() {
    let mut client = device_with_gaps(6, &[1, 3, 5]);
    let report = PollEngine::new(2).run_cycle(&mut client, &entities(6)).await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.values.len(), 3);
}

#[tokio::test]
async fn test_connect_failure_short_circuits() {
    let mut client = MockClient::modbus().holding(0, &[1]).refuse_connect();
    let state = client.state();

    let report = PollEngine::default().run_cycle(&mut client, &entities(1)).await;

    assert_eq!(report.outcome, CycleOutcome::NotConnected);
    assert!(report.values.is_empty());
    assert_eq!(state.connects(), 1);
    assert_eq!(state.reads(), 0);
}

#[tokio::test]
async fn test_auto_detect_resolves_coil_and_caches_it() {
    let mut client = MockClient::modbus().coils(7, &[true]);
    let state = client.state();
    let engine = PollEngine::default();
    let entity = modbus_entity("Pump", 7, ModbusDataType::Uint16, RegisterType::Auto);
    let list = vec![entity];

    let report = engine.run_cycle(&mut client, &list).await;
    assert_eq!(report.values["pump"].value, ProtocolValue::Bool(true));
    assert_eq!(
        state.kinds_read(7),
        vec![RegisterKind::Holding, RegisterKind::Input, RegisterKind::Coil]
    );
    assert_eq!(engine.detected_kind(7), Some(RegisterKind::Coil));

    // Next cycle goes straight to the remembered kind
    engine.run_cycle(&mut client, &list).await;
    assert_eq!(state.kinds_read(7).len(), 4);
    assert_eq!(state.kinds_read(7)[3], RegisterKind::Coil);
}

#[tokio::test]
async fn test_auto_detect_rejects_short_responses() {
    // Two-word type: a single-word holding answer is the wrong width
    let mut client = MockClient::modbus()
        .holding(20, &[1])
        .respond(
            Address::Register(20),
            Some(RegisterKind::Input),
            RawValue::Registers(vec![0, 42]),
        );
    let engine = PollEngine::default();
    let list = vec![modbus_entity(
        "Counter",
        20,
        ModbusDataType::Uint32,
        RegisterType::Auto,
    )];

    let report = engine.run_cycle(&mut client, &list).await;
    assert_eq!(report.values["counter"].value, ProtocolValue::Integer(42));
    assert_eq!(engine.detected_kind(20), Some(RegisterKind::Input));
}

#[tokio::test]
async fn test_write_only_entities_are_not_polled() {
    let mut client = MockClient::modbus().holding(0, &[1]).holding(1, &[2]);
    let state = client.state();
    let mut command = holding_u16("Command", 1);
    command.rw = pollsrv::core::entity::RwMode::Write;
    let list = vec![holding_u16("Status", 0), command];

    let report = PollEngine::default().run_cycle(&mut client, &list).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(state.reads(), 1);
    assert_eq!(*state.primed.lock(), vec![Address::Register(0)]);
}

// ============================================================================
// Coordinator
// ============================================================================

#[tokio::test]
async fn test_write_to_read_only_entity_does_no_io() {
    let (client, state) = MockClient::modbus().holding(0, &[1]).shared();
    let coordinator = Coordinator::new(
        "boiler",
        Protocol::Modbus,
        client,
        vec![holding_u16("Status", 0)],
        INTERVAL,
    );

    let value = ProtocolValue::Integer(5);
    let err = coordinator
        .try_write_entity("status", &value, &EntityOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PollSrvError::ReadOnlyEntity(_)));
    assert!(
        !coordinator
            .write_entity("Status", &value, &EntityOverrides::default())
            .await
    );
    assert_eq!(state.wire_ops(), 0);
}

#[tokio::test]
async fn test_write_to_discrete_input_rejected() {
    let (client, state) = MockClient::modbus().shared();
    let entity = writable(modbus_entity(
        "Alarm",
        3,
        ModbusDataType::Uint16,
        RegisterType::Discrete,
    ));
    let coordinator = Coordinator::new("plc", Protocol::Modbus, client, vec![entity], INTERVAL);

    for value in [ProtocolValue::Bool(true), ProtocolValue::Integer(0)] {
        let err = coordinator
            .try_write_entity("alarm", &value, &EntityOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PollSrvError::ReadOnlyRegister { .. }), "{err}");
    }

    // An override to input registers is just as read-only
    let overrides = EntityOverrides {
        register_type: Some(RegisterType::Input),
        ..Default::default()
    };
    assert!(
        !coordinator
            .write_entity("alarm", &ProtocolValue::Integer(1), &overrides)
            .await
    );
    assert_eq!(state.wire_ops(), 0);
}

#[tokio::test]
async fn test_write_to_snmp_walk_target_rejected() {
    let (client, state) = MockClient::new(Protocol::Snmp).shared();
    let entity = writable(snmp_entity(
        "Interfaces",
        "1.3.6.1.2.1.2.2.1.2",
        SnmpDataType::String,
        true,
    ));
    let coordinator = Coordinator::new("switch", Protocol::Snmp, client, vec![entity], INTERVAL);

    let err = coordinator
        .try_write_entity(
            "interfaces",
            &ProtocolValue::String("eth0".into()),
            &EntityOverrides::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PollSrvError::ReadOnlyTarget(_)));
    assert_eq!(state.wire_ops(), 0);
}

#[tokio::test]
async fn test_scaled_read_and_write_round_trip() {
    let (client, state) = MockClient::modbus().holding(0, &[10]).shared();
    let entity = writable(scaled(holding_u16("Setpoint", 0), 2.0, 1.0));
    let coordinator = Coordinator::new("boiler", Protocol::Modbus, client, vec![entity], INTERVAL);

    let read = coordinator
        .read_entity("setpoint", &EntityOverrides::default())
        .await
        .unwrap();
    let ReadOutput::Value(point) = read else {
        panic!("expected a decoded value");
    };
    assert_eq!(point.value, ProtocolValue::Float(21.0));

    assert!(
        coordinator
            .write_entity("setpoint", &point.value, &EntityOverrides::default())
            .await
    );
    let log = state.write_log.lock();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1, RawValue::Registers(vec![10]));
    assert_eq!(log[0].2.kind, Some(RegisterKind::Holding));
}

#[tokio::test]
async fn test_unacknowledged_write_is_false_not_error() {
    let (client, _state) = MockClient::modbus()
        .holding(0, &[0])
        .nack_writes(Address::Register(0))
        .shared();
    let coordinator = Coordinator::new(
        "boiler",
        Protocol::Modbus,
        client,
        vec![writable(holding_u16("Mode", 0))],
        INTERVAL,
    );
    let result = coordinator
        .try_write_entity("mode", &ProtocolValue::Integer(1), &EntityOverrides::default())
        .await;
    assert_eq!(result, Ok(false));
}

#[tokio::test]
async fn test_write_option_maps_label_to_raw_value() {
    let (client, state) = MockClient::modbus().holding(16, &[0]).shared();
    let mut mode = writable(holding_u16("Mode", 16));
    mode.options = Some(BTreeMap::from([
        ("0".to_string(), "Off".to_string()),
        ("1".to_string(), "Heat".to_string()),
    ]));
    let coordinator = Coordinator::new("boiler", Protocol::Modbus, client, vec![mode], INTERVAL);

    assert!(coordinator.write_option("mode", "Heat").await);
    assert_eq!(
        state.write_log.lock()[0].1,
        RawValue::Registers(vec![1])
    );

    let err = coordinator.try_write_option("mode", "Turbo").await.unwrap_err();
    assert!(matches!(err, PollSrvError::NotFound(_)));
    assert_eq!(state.writes(), 1);

    // Display side of the same map
    let snapshot = coordinator.refresh_now().await;
    assert_eq!(snapshot.values["mode"].display.as_deref(), Some("Off"));
}

#[tokio::test]
async fn test_read_overrides_do_not_touch_stored_config() {
    let (client, _state) = MockClient::modbus().holding(0, &[0xFFFF]).shared();
    let coordinator = Coordinator::new(
        "boiler",
        Protocol::Modbus,
        client,
        vec![holding_u16("Raw Word", 0)],
        INTERVAL,
    );

    let overrides = EntityOverrides {
        data_type: Some("int16".into()),
        ..Default::default()
    };
    let signed = coordinator.read_entity("raw_word", &overrides).await.unwrap();
    assert!(matches!(signed, ReadOutput::Value(ref p) if p.value == ProtocolValue::Integer(-1)));

    let plain = coordinator
        .read_entity("raw_word", &EntityOverrides::default())
        .await
        .unwrap();
    assert!(
        matches!(plain, ReadOutput::Value(ref p) if p.value == ProtocolValue::Integer(65535))
    );
}

#[tokio::test]
async fn test_raw_read_reports_detected_kind() {
    let (client, _state) = MockClient::modbus()
        .respond(
            Address::Register(30),
            Some(RegisterKind::Input),
            RawValue::Registers(vec![1, 2]),
        )
        .shared();
    let entity = modbus_entity("Energy", 30, ModbusDataType::Uint32, RegisterType::Auto);
    let coordinator = Coordinator::new("meter", Protocol::Modbus, client, vec![entity], INTERVAL);

    let output = coordinator
        .try_read_entity("energy", &EntityOverrides::raw())
        .await
        .unwrap()
        .unwrap();
    let ReadOutput::Raw(report) = output else {
        panic!("expected a raw report");
    };
    assert_eq!(
        report,
        json!({
            "registers": [1, 2],
            "detected_type": "input",
            "address": 30,
            "size": 2,
        })
    );
}

#[tokio::test]
async fn test_unknown_entity_is_not_found() {
    let (client, _state) = MockClient::modbus().shared();
    let coordinator = Coordinator::new("boiler", Protocol::Modbus, client, vec![], INTERVAL);
    let err = coordinator
        .try_read_entity("missing", &EntityOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PollSrvError::NotFound(_)));
}

#[tokio::test]
async fn test_refresh_publishes_snapshot() {
    let (client, _state) = MockClient::modbus().holding(0, &[7]).shared();
    let coordinator = Coordinator::new(
        "boiler",
        Protocol::Modbus,
        client,
        vec![holding_u16("Status", 0)],
        INTERVAL,
    );
    let mut rx = coordinator.subscribe();

    assert!(coordinator.refresh().await);
    rx.changed().await.unwrap();
    let snapshot = rx.borrow_and_update().clone();
    assert!(snapshot.last_update_success);
    assert_eq!(snapshot.cycle, 1);
    assert!(snapshot.updated_at.is_some());
    assert_eq!(snapshot.values["status"].value, ProtocolValue::Integer(7));
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert_eq!(coordinator.snapshot(), snapshot);
}

#[tokio::test]
async fn test_snapshot_tracks_connection_state() {
    let (client, _state) = MockClient::modbus().holding(0, &[1]).refuse_connect().shared();
    let coordinator = Coordinator::new(
        "boiler",
        Protocol::Modbus,
        client,
        vec![holding_u16("Status", 0)],
        INTERVAL,
    );
    assert_eq!(coordinator.snapshot().connection, ConnectionState::Disconnected);

    let snapshot = coordinator.refresh_now().await;
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert_eq!(coordinator.connection_state().await, ConnectionState::Disconnected);

    // aborted cycles drop the connection
    let (client, _state) = device_with_gaps(8, &[3, 4]).shared();
    let coordinator = Coordinator::new("boiler", Protocol::Modbus, client, entities(8), INTERVAL)
        .with_engine(PollEngine::new(2));
    let snapshot = coordinator.refresh_now().await;
    assert!(!snapshot.last_update_success);
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_device_retries_next_cycle() {
    let (client, state) = MockClient::modbus().refuse_connect().shared();
    let coordinator = Coordinator::new(
        "boiler",
        Protocol::Modbus,
        client,
        vec![holding_u16("Status", 0)],
        INTERVAL,
    );

    let first = coordinator.refresh_now().await;
    assert!(!first.last_update_success);
    assert!(first.values.is_empty());
    assert_eq!(state.connects(), 1);

    coordinator.refresh_now().await;
    assert_eq!(state.connects(), 2);
    assert!(!coordinator.is_connected().await);
}

#[tokio::test]
async fn test_busy_client_skips_scheduled_refresh() {
    let (client, state) = MockClient::modbus().holding(0, &[1]).shared();
    let coordinator = Coordinator::new(
        "boiler",
        Protocol::Modbus,
        client.clone(),
        vec![holding_u16("Status", 0)],
        INTERVAL,
    );

    let guard = client.lock().await;
    assert!(!coordinator.refresh().await);
    drop(guard);

    assert_eq!(state.reads(), 0);
    assert!(coordinator.refresh().await);
    assert_eq!(state.reads(), 1);
}
