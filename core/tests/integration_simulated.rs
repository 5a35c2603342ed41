// Integration test: central manager driving the simulated BLE stack
//
// End-to-end flows with the in-process simulator answering every request:
// scan -> connect -> discover -> read/write -> notify -> disconnect, plus an
// unresponsive device and a device-side link drop. Runs on a paused clock so
// latencies and notification periods cost no wall time.

use bleman_core::{
    event_channel, from_short, spawn_central, BleError, CentralConfig, CentralEvent, CentralHandle,
    CharacteristicProperties, CharacteristicRef, ConnectionState, Service, SimulatedPeripheral,
    SimulatedPlatform, WriteType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn battery_level() -> CharacteristicRef {
    CharacteristicRef::new(from_short(0x180F), from_short(0x2A19))
}

fn uart_rx() -> CharacteristicRef {
    CharacteristicRef::new(from_short(0xFFE0), from_short(0xFFE1))
}

fn sensor() -> SimulatedPeripheral {
    SimulatedPeripheral::new("sim-sensor")
        .with_name("Sensor")
        .with_rssi(-52)
        .with_service(Service::new(from_short(0x180F)).with_characteristic(
            battery_level().characteristic,
            CharacteristicProperties::readable().with_notify(),
        ))
        .with_service(Service::new(from_short(0xFFE0)).with_characteristic(
            uart_rx().characteristic,
            CharacteristicProperties::default()
                .with_write()
                .with_write_without_response(),
        ))
        .with_value(from_short(0x180F), from_short(0x2A19), vec![87])
}

fn start(config: CentralConfig) -> (Arc<SimulatedPlatform>, CentralHandle, broadcast::Receiver<CentralEvent>) {
    let (sink, platform_events) = event_channel();
    let platform = Arc::new(
        SimulatedPlatform::new(sink)
            .with_latency(Duration::from_millis(15))
            .with_notify_period(Duration::from_millis(250)),
    );
    platform.add_peripheral(sensor());
    platform.add_peripheral(SimulatedPeripheral::new("sim-mute").unresponsive());

    let central = spawn_central(platform.clone(), platform_events, config).expect("valid config");
    let events = central.events();
    (platform, central, events)
}

async fn wait_for(events: &mut broadcast::Receiver<CentralEvent>, wanted: impl Fn(&CentralEvent) -> bool) {
    loop {
        let event = timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event in time")
            .expect("event stream open");
        if wanted(&event) {
            return;
        }
    }
}

async fn scan_all(central: &CentralHandle, events: &mut broadcast::Receiver<CentralEvent>) {
    central
        .start_scan(vec![], Some(Duration::from_secs(2)))
        .await
        .expect("scan");
    wait_for(events, |e| *e == CentralEvent::ScanStopped).await;
}

#[tokio::test(start_paused = true)]
async fn test_full_session_against_simulator() {
    let (platform, central, mut events) = start(CentralConfig::default());

    scan_all(&central, &mut events).await;
    let found = central.discovered_peripherals().await.expect("alive");
    assert_eq!(found.len(), 2);
    let info = central.peripheral("sim-sensor").await.expect("found");
    assert_eq!(info.name.as_deref(), Some("Sensor"));
    assert_eq!(info.rssi, Some(-52));
    println!("✓ Scan found {} devices", found.len());

    central.connect("sim-sensor", None).await.expect("connect");
    let services = central.discover_services("sim-sensor").await.expect("discover");
    assert_eq!(services.len(), 2);
    println!("✓ Connected and discovered {} services", services.len());

    let level = central.read("sim-sensor", "180F", "2A19").await.expect("read");
    assert_eq!(level, vec![87]);

    central
        .write("sim-sensor", "FFE0", "FFE1", b"hello".to_vec(), WriteType::WithResponse)
        .await
        .expect("write");
    central
        .write("sim-sensor", "FFE0", "FFE1", b"world".to_vec(), WriteType::WithoutResponse)
        .await
        .expect("write without response");
    // Let the unacknowledged write reach the device
    central.read_rssi("sim-sensor").await.expect("rssi");
    let log: Vec<Vec<u8>> = platform
        .write_log("sim-sensor")
        .into_iter()
        .map(|(_, data)| data)
        .collect();
    assert_eq!(log, vec![b"hello".to_vec(), b"world".to_vec()]);
    println!("✓ Writes delivered in order");

    let mut stream = central
        .subscribe("sim-sensor", "180F", "2A19")
        .await
        .expect("subscribe");
    platform.set_value("sim-sensor", battery_level(), vec![86]);
    for _ in 0..2 {
        let notification = timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("notification in time")
            .expect("stream open");
        assert_eq!(notification.value, vec![86]);
    }
    central
        .unsubscribe("sim-sensor", "180F", "2A19")
        .await
        .expect("unsubscribe");
    while stream.recv().await.is_some() {}
    println!("✓ Notifications streamed until unsubscribe");

    central.disconnect("sim-sensor").await.expect("disconnect");
    wait_for(&mut events, |e| {
        matches!(e, CentralEvent::PeripheralDisconnected { peripheral, error: None } if peripheral == "sim-sensor")
    })
    .await;
    let info = central.peripheral("sim-sensor").await.expect("kept");
    assert_eq!(info.state, ConnectionState::Disconnected);
    assert!(!platform.is_connected("sim-sensor"));

    central.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_device_times_out() {
    let (_platform, central, mut events) = start(CentralConfig::default());
    scan_all(&central, &mut events).await;

    let result = central
        .connect("sim-mute", Some(Duration::from_secs(5)))
        .await;
    assert!(matches!(result, Err(BleError::Timeout(_))), "got {:?}", result);

    let info = central.peripheral("sim-mute").await.expect("known");
    assert_eq!(info.state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_device_drop_is_reported() {
    let (platform, central, mut events) = start(CentralConfig::default());
    scan_all(&central, &mut events).await;
    central.connect("sim-sensor", None).await.expect("connect");
    central.discover_services("sim-sensor").await.expect("discover");
    let mut stream = central
        .subscribe("sim-sensor", "180F", "2A19")
        .await
        .expect("subscribe");

    platform.drop_link("sim-sensor", "connection timeout");
    wait_for(&mut events, |e| {
        matches!(
            e,
            CentralEvent::PeripheralDisconnected { error: Some(reason), .. } if reason == "connection timeout"
        )
    })
    .await;

    while stream.recv().await.is_some() {}
    let read = central.read("sim-sensor", "180F", "2A19").await;
    assert!(matches!(read, Err(BleError::InvalidState(_))));

    // Reconnecting reuses the same record
    central.connect("sim-sensor", None).await.expect("reconnect");
    assert_eq!(central.discovered_peripherals().await.expect("alive").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scan_filters_reach_simulator() {
    let (_platform, central, mut events) = start(CentralConfig::default());
    central
        .start_scan(vec![from_short(0x180F)], Some(Duration::from_secs(1)))
        .await
        .expect("scan");
    wait_for(&mut events, |e| *e == CentralEvent::ScanStopped).await;

    let ids: Vec<String> = central
        .discovered_peripherals()
        .await
        .expect("alive")
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec!["sim-sensor".to_string()]);
}
