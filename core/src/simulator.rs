//! In-process simulated BLE stack
//!
//! `SimulatedPlatform` answers every primitive request of the central manager
//! from a table of virtual peripherals, pushing the resulting events through
//! the `EventSink` after a configurable latency. Used by the CLI demo and by
//! integration tests that need a platform without radio hardware.
//!
//! Events are delivered by a single pump task, so results come back in the
//! order the requests were issued. Must be created inside a tokio runtime.

use crate::central::{AdapterState, BlePlatform, EventSink, PlatformEvent};
use crate::gatt::{CharacteristicRef, Service, ServiceTree, WriteType};
use crate::BleError;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// A virtual remote device
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertisement: Vec<u8>,
    pub services: ServiceTree,
    values: HashMap<CharacteristicRef, Vec<u8>>,
    /// Accepts requests but never answers them
    pub unresponsive: bool,
}

impl SimulatedPeripheral {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: -60,
            advertisement: Vec::new(),
            services: Vec::new(),
            values: HashMap::new(),
            unresponsive: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_advertisement(mut self, advertisement: Vec<u8>) -> Self {
        self.advertisement = advertisement;
        self
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Initial value returned by reads and sent by notifications
    pub fn with_value(mut self, service: Uuid, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.values
            .insert(CharacteristicRef::new(service, characteristic), value);
        self
    }

    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    fn advertises_any(&self, filters: &[Uuid]) -> bool {
        filters.is_empty()
            || filters
                .iter()
                .any(|f| self.services.iter().any(|s| &s.uuid == f))
    }

    fn has_characteristic(&self, target: &CharacteristicRef) -> bool {
        self.services
            .iter()
            .find(|s| s.uuid == target.service)
            .and_then(|s| s.characteristic(&target.characteristic))
            .is_some()
    }
}

type NotifyKey = (String, CharacteristicRef);

#[derive(Default)]
struct SimState {
    peripherals: HashMap<String, SimulatedPeripheral>,
    connected: HashSet<String>,
    scanning: Option<Vec<Uuid>>,
    notifying: HashMap<NotifyKey, JoinHandle<()>>,
    write_log: HashMap<String, Vec<(CharacteristicRef, Vec<u8>)>>,
}

impl SimState {
    fn stop_notifications(&mut self, peripheral: &str) {
        self.notifying.retain(|(id, _), task| {
            if id == peripheral {
                task.abort();
                false
            } else {
                true
            }
        });
    }
}

/// Simulated platform BLE stack
pub struct SimulatedPlatform {
    state: Arc<RwLock<SimState>>,
    outbox: mpsc::UnboundedSender<(Instant, PlatformEvent)>,
    latency: Duration,
    notify_period: Duration,
}

impl SimulatedPlatform {
    pub fn new(sink: EventSink) -> Self {
        let (outbox, mut rx) = mpsc::unbounded_channel::<(Instant, PlatformEvent)>();
        tokio::spawn(async move {
            while let Some((due, event)) = rx.recv().await {
                tokio::time::sleep_until(due).await;
                trace!("Simulated event: {:?}", event);
                if !sink.send(event) {
                    debug!("Central manager gone; simulated stack idle");
                    break;
                }
            }
        });

        Self {
            state: Arc::new(RwLock::new(SimState::default())),
            outbox,
            latency: Duration::from_millis(20),
            notify_period: Duration::from_millis(500),
        }
    }

    /// Delay between a request and its result event
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Interval between values of an enabled notification
    pub fn with_notify_period(mut self, period: Duration) -> Self {
        self.notify_period = period;
        self
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.state
            .write()
            .peripherals
            .insert(peripheral.id.clone(), peripheral);
    }

    pub fn set_unresponsive(&self, id: &str, unresponsive: bool) {
        if let Some(peripheral) = self.state.write().peripherals.get_mut(id) {
            peripheral.unresponsive = unresponsive;
        }
    }

    pub fn set_value(&self, id: &str, target: CharacteristicRef, value: Vec<u8>) {
        if let Some(peripheral) = self.state.write().peripherals.get_mut(id) {
            peripheral.values.insert(target, value);
        }
    }

    /// Every payload the device received, in arrival order
    pub fn write_log(&self, id: &str) -> Vec<(CharacteristicRef, Vec<u8>)> {
        self.state
            .read()
            .write_log
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.state.read().connected.contains(id)
    }

    pub fn is_scanning(&self) -> bool {
        self.state.read().scanning.is_some()
    }

    /// Push a value from the device, as if the characteristic notified
    pub fn notify(&self, id: &str, target: CharacteristicRef, value: Vec<u8>) {
        self.post(PlatformEvent::CharacteristicValueUpdated {
            peripheral: id.to_string(),
            characteristic: target,
            value: Ok(value),
            for_read: false,
        });
    }

    /// Device-side link loss
    pub fn drop_link(&self, id: &str, reason: &str) {
        {
            let mut state = self.state.write();
            if !state.connected.remove(id) {
                return;
            }
            state.stop_notifications(id);
        }
        self.post(PlatformEvent::Disconnected {
            peripheral: id.to_string(),
            error: Some(reason.to_string()),
        });
    }

    /// Report an adapter state change; powering off drops every link
    pub fn set_adapter_state(&self, adapter: AdapterState) {
        if !adapter.is_usable() {
            let mut state = self.state.write();
            state.connected.clear();
            state.scanning = None;
            for (_, task) in state.notifying.drain() {
                task.abort();
            }
        }
        self.post(PlatformEvent::AdapterStateChanged(adapter));
    }

    /// Deliver immediately
    fn post(&self, event: PlatformEvent) {
        let _ = self.outbox.send((Instant::now(), event));
    }

    /// Deliver after the configured latency
    fn reply(&self, event: PlatformEvent) {
        let _ = self.outbox.send((Instant::now() + self.latency, event));
    }

    /// Look up a device that should answer; `Ok(None)` for unresponsive ones
    fn responsive(&self, id: &str) -> Result<Option<SimulatedPeripheral>, BleError> {
        let state = self.state.read();
        let peripheral = state
            .peripherals
            .get(id)
            .ok_or_else(|| BleError::Platform(format!("no device {}", id)))?;
        if peripheral.unresponsive {
            trace!("{} is unresponsive", id);
            return Ok(None);
        }
        Ok(Some(peripheral.clone()))
    }

    fn ensure_link(&self, id: &str) -> Result<(), BleError> {
        if self.is_connected(id) {
            Ok(())
        } else {
            Err(BleError::Platform(format!("{} not connected", id)))
        }
    }

    fn spawn_notifier(&self, id: &str, target: CharacteristicRef) -> JoinHandle<()> {
        let state: Weak<RwLock<SimState>> = Arc::downgrade(&self.state);
        let outbox = self.outbox.clone();
        let period = self.notify_period;
        let id = id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let value = {
                    let state = state.read();
                    if !state.connected.contains(&id) {
                        break;
                    }
                    state
                        .peripherals
                        .get(&id)
                        .and_then(|p| p.values.get(&target))
                        .cloned()
                        .unwrap_or_default()
                };
                let event = PlatformEvent::CharacteristicValueUpdated {
                    peripheral: id.clone(),
                    characteristic: target,
                    value: Ok(value),
                    for_read: false,
                };
                if outbox.send((Instant::now(), event)).is_err() {
                    break;
                }
            }
        })
    }
}

impl BlePlatform for SimulatedPlatform {
    fn start_scan(&self, service_filters: &[Uuid]) -> Result<(), BleError> {
        let found: Vec<SimulatedPeripheral> = {
            let mut state = self.state.write();
            state.scanning = Some(service_filters.to_vec());
            state
                .peripherals
                .values()
                .filter(|p| p.advertises_any(service_filters))
                .cloned()
                .collect()
        };
        debug!("Simulated scan: {} devices in range", found.len());
        for peripheral in found {
            self.reply(PlatformEvent::PeripheralDiscovered {
                peripheral: peripheral.id,
                name: peripheral.name,
                rssi: Some(peripheral.rssi),
                advertisement: peripheral.advertisement,
            });
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), BleError> {
        self.state.write().scanning = None;
        Ok(())
    }

    fn connect(&self, peripheral: &str) -> Result<(), BleError> {
        if self.responsive(peripheral)?.is_none() {
            return Ok(());
        }
        self.state.write().connected.insert(peripheral.to_string());
        self.reply(PlatformEvent::Connected {
            peripheral: peripheral.to_string(),
        });
        Ok(())
    }

    fn disconnect(&self, peripheral: &str) -> Result<(), BleError> {
        {
            let mut state = self.state.write();
            state.connected.remove(peripheral);
            state.stop_notifications(peripheral);
        }
        self.reply(PlatformEvent::Disconnected {
            peripheral: peripheral.to_string(),
            error: None,
        });
        Ok(())
    }

    fn discover_services(&self, peripheral: &str) -> Result<(), BleError> {
        self.ensure_link(peripheral)?;
        if let Some(device) = self.responsive(peripheral)? {
            self.reply(PlatformEvent::ServicesDiscovered {
                peripheral: device.id,
                result: Ok(device.services),
            });
        }
        Ok(())
    }

    fn read(&self, peripheral: &str, characteristic: &CharacteristicRef) -> Result<(), BleError> {
        self.ensure_link(peripheral)?;
        if let Some(device) = self.responsive(peripheral)? {
            let value = if device.has_characteristic(characteristic) {
                Ok(device.values.get(characteristic).cloned().unwrap_or_default())
            } else {
                Err(format!("attribute {} not found (0x0A)", characteristic))
            };
            self.reply(PlatformEvent::CharacteristicValueUpdated {
                peripheral: device.id,
                characteristic: *characteristic,
                value,
                for_read: true,
            });
        }
        Ok(())
    }

    fn write(
        &self,
        peripheral: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        self.ensure_link(peripheral)?;
        let Some(device) = self.responsive(peripheral)? else {
            return Ok(());
        };
        {
            let mut state = self.state.write();
            state
                .write_log
                .entry(device.id.clone())
                .or_default()
                .push((*characteristic, data.to_vec()));
            if let Some(stored) = state.peripherals.get_mut(&device.id) {
                stored.values.insert(*characteristic, data.to_vec());
            }
        }
        if write_type == WriteType::WithResponse {
            self.reply(PlatformEvent::WriteConfirmed {
                peripheral: device.id,
                characteristic: *characteristic,
                result: Ok(()),
            });
        }
        Ok(())
    }

    fn set_notify(
        &self,
        peripheral: &str,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), BleError> {
        self.ensure_link(peripheral)?;
        let Some(device) = self.responsive(peripheral)? else {
            return Ok(());
        };
        let key = (device.id.clone(), *characteristic);
        if enabled {
            let task = self.spawn_notifier(&device.id, *characteristic);
            if let Some(previous) = self.state.write().notifying.insert(key, task) {
                previous.abort();
            }
        } else if let Some(task) = self.state.write().notifying.remove(&key) {
            task.abort();
        }
        self.reply(PlatformEvent::NotifyStateChanged {
            peripheral: device.id,
            characteristic: *characteristic,
            result: Ok(enabled),
        });
        Ok(())
    }

    fn read_rssi(&self, peripheral: &str) -> Result<(), BleError> {
        self.ensure_link(peripheral)?;
        if let Some(device) = self.responsive(peripheral)? {
            self.reply(PlatformEvent::RssiRead {
                peripheral: device.id,
                result: Ok(device.rssi),
            });
        }
        Ok(())
    }
}
