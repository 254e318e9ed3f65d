//! End-to-end Modbus TCP tests against the in-process simulator

#![allow(clippy::disallowed_methods)]

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use pollsrv::core::coordinator::ReadOutput;
use pollsrv::core::entity::EntityOverrides;
use pollsrv::core::types::ProtocolValue;
use pollsrv::protocols::modbus::ModbusSimulator;
use pollsrv::{AppConfig, PollSrvError, Runtime};

async fn start(sim: &ModbusSimulator) -> (SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let addr = sim.start(cancel.clone()).await.unwrap();
    (addr, cancel)
}

fn config(yaml: &str, addr: SocketAddr) -> AppConfig {
    let yaml = yaml
        .replace("@HOST@", &addr.ip().to_string())
        .replace("@PORT@", &addr.port().to_string());
    AppConfig::from_yaml_str(&yaml).unwrap()
}

const BOILER: &str = r#"
service:
  default_timeout: 1.0
devices:
  - name: boiler
    connection: { protocol: modbus_tcp, host: "@HOST@", port: @PORT@, slave_id: 3 }
    entities:
      - { name: Supply Temp, address: 100, data_type: int16, scale: 0.1, format: "{value:.1} °C" }
      - { name: Energy, address: 200, data_type: uint32 }
      - { name: Energy Swapped, address: 200, data_type: uint32, word_order: little }
      - { name: Label, address: 300, data_type: string, count: 2 }
      - { name: Flow, address: 400, data_type: float32 }
      - { name: Pump, address: 5, data_type: uint16, register_type: auto, rw: rw }
      - { name: Setpoint, address: 10, data_type: uint16, scale: 0.5, rw: rw }
      - { name: Total, address: 20, data_type: uint32, rw: rw }
      - { name: Alarm, address: 7, data_type: uint16, register_type: discrete, rw: rw }
"#;

fn boiler_image() -> ModbusSimulator {
    ModbusSimulator::new()
        .with_holding(100, &[0xFF38])
        .with_holding(200, &[0x0001, 0x0002])
        .with_holding(300, &[0x4F4B, 0x0000])
        .with_holding(400, &[0x41AC, 0x0000])
        .with_holding(10, &[40])
        .with_holding(20, &[0, 0])
        .with_coils(5, &[true])
        .with_discrete(7, &[false])
}

#[tokio::test]
async fn test_poll_cycle_decodes_all_types() {
    let sim = boiler_image();
    let (addr, cancel) = start(&sim).await;
    let runtime = Runtime::build(&config(BOILER, addr)).unwrap();
    let boiler = runtime.coordinator("boiler").unwrap();

    let snapshot = boiler.refresh_now().await;
    assert!(snapshot.last_update_success, "{snapshot:?}");

    let values = &snapshot.values;
    assert_eq!(values["supply_temp"].value, ProtocolValue::Float(-20.0));
    assert_eq!(values["supply_temp"].display.as_deref(), Some("-20.0 °C"));
    assert_eq!(values["energy"].value, ProtocolValue::Integer(65538));
    assert_eq!(values["energy_swapped"].value, ProtocolValue::Integer(131073));
    assert_eq!(values["label"].value, ProtocolValue::String("OK".into()));
    assert_eq!(values["flow"].value, ProtocolValue::Float(21.5));
    assert_eq!(values["pump"].value, ProtocolValue::Bool(true));
    assert_eq!(values["setpoint"].value, ProtocolValue::Float(20.0));
    assert_eq!(sim.last_unit(), 3);

    runtime.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_auto_detect_against_exceptions() {
    let sim = boiler_image();
    let (addr, cancel) = start(&sim).await;
    let runtime = Runtime::build(&config(BOILER, addr)).unwrap();
    let boiler = runtime.coordinator("boiler").unwrap();

    let before = sim.request_count();
    let raw = boiler
        .try_read_entity("pump", &EntityOverrides::raw())
        .await
        .unwrap()
        .unwrap();
    // holding and input answer with exceptions before the coil read succeeds
    assert_eq!(sim.request_count() - before, 3);
    let ReadOutput::Raw(report) = raw else {
        panic!("expected raw output");
    };
    assert_eq!(report["detected_type"], "coil");
    assert_eq!(report["value"], true);

    let before = sim.request_count();
    boiler
        .read_entity("pump", &EntityOverrides::default())
        .await
        .unwrap();
    assert_eq!(sim.request_count() - before, 1);

    runtime.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_writes_reach_the_device() {
    let sim = boiler_image();
    let (addr, cancel) = start(&sim).await;
    let runtime = Runtime::build(&config(BOILER, addr)).unwrap();
    let boiler = runtime.coordinator("boiler").unwrap();
    let none = EntityOverrides::default();

    // Inverse scale: 30.0 / 0.5
    assert!(
        boiler
            .write_entity("setpoint", &ProtocolValue::Float(30.0), &none)
            .await
    );
    assert_eq!(sim.holding(10), Some(60));

    // Two registers go out as one FC16 request
    assert!(
        boiler
            .write_entity("total", &ProtocolValue::Integer(0x0003_0004), &none)
            .await
    );
    assert_eq!(sim.holding(20), Some(3));
    assert_eq!(sim.holding(21), Some(4));

    // Auto-detected coil
    assert!(
        boiler
            .write_entity("pump", &ProtocolValue::Integer(0), &none)
            .await
    );
    assert_eq!(sim.coil(5), Some(false));

    runtime.shutdown().await;
    cancel.cancel();
}

#[tokio::test]
async fn test_discrete_write_never_reaches_the_wire() {
    let sim = boiler_image();
    let (addr, cancel) = start(&sim).await;
    let runtime = Runtime::build(&config(BOILER, addr)).unwrap();
    let boiler = runtime.coordinator("boiler").unwrap();

    let err = boiler
        .try_write_entity("alarm", &ProtocolValue::Bool(true), &EntityOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PollSrvError::ReadOnlyRegister { .. }));
    assert_eq!(sim.request_count(), 0);

    runtime.shutdown().await;
    cancel.cancel();
}

const GATEWAY: &str = r#"
devices:
  - name: meter-a
    connection: { protocol: modbus_tcp, host: "@HOST@", port: @PORT@, slave_id: 1 }
    entities:
      - { name: Power, address: 0, data_type: uint16 }
  - name: meter-b
    connection: { protocol: modbus_tcp, host: "@HOST@", port: @PORT@, slave_id: 2 }
    entities:
      - { name: Power, address: 0, data_type: uint16 }
"#;

#[tokio::test]
async fn test_slaves_behind_one_gateway_share_a_connection() {
    let sim = ModbusSimulator::new().with_holding(0, &[42]);
    let (addr, cancel) = start(&sim).await;
    let runtime = Runtime::build(&config(GATEWAY, addr)).unwrap();
    assert_eq!(runtime.pool().len(), 1);

    let a = runtime.coordinator("meter-a").unwrap();
    let b = runtime.coordinator("meter-b").unwrap();

    let snap = b.refresh_now().await;
    assert_eq!(snap.values["power"].value, ProtocolValue::Integer(42));
    assert_eq!(sim.last_unit(), 2);

    a.refresh_now().await;
    assert_eq!(sim.last_unit(), 1);

    // One shared client: the second device found it already connected
    assert!(a.is_connected().await);
    assert!(b.is_connected().await);

    runtime.shutdown().await;
    assert!(runtime.pool().is_empty());
    assert!(!a.is_connected().await);
    cancel.cancel();
}

#[tokio::test]
async fn test_runtime_polls_until_cancelled() {
    let sim = ModbusSimulator::new().with_holding(0, &[42]);
    let (addr, sim_cancel) = start(&sim).await;
    let runtime = Runtime::build(&config(GATEWAY, addr)).unwrap();
    let mut rx = runtime.coordinator("meter-a").unwrap().subscribe();

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let watcher = tokio::spawn(async move {
        rx.changed().await.unwrap();
        let ok = rx.borrow().last_update_success;
        stop.cancel();
        ok
    });

    // The first interval tick fires immediately
    tokio::time::timeout(std::time::Duration::from_secs(5), runtime.run(cancel))
        .await
        .unwrap();
    assert!(watcher.await.unwrap());

    runtime.shutdown().await;
    sim_cancel.cancel();
}
