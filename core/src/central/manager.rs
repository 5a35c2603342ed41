//! Central manager task
//!
//! Owns the registry, every pending-operation table, the write queues and the
//! scan controller. Commands from handles, events from the platform stack and
//! deadlines from `Timers` are all consumed by one loop, so no two of them
//! ever touch session state at the same time.

use super::events::{CentralEvent, Notification, NotificationStream};
use super::handle::Command;
use super::pending::{OperationKind, PendingKey, PendingTable, Reply};
use super::platform::{AdapterState, BlePlatform, PlatformEvent, PlatformEvents};
use super::registry::PeripheralRegistry;
use super::scan::{ScanController, ScanStart};
use super::timer::{TimerEvent, TimerGuard, Timers};
use super::write_queue::{
    chunk_payload, DispatchContext, PacedWrite, PacedWrites, WriteQueues, WriteTask,
};
use crate::config::CentralConfig;
use crate::gatt::{
    Characteristic, CharacteristicRef, ConnectionState, PeripheralInfo, ServiceTree,
    SubscriptionState, WriteType,
};
use crate::BleError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reject a command during validation; nothing reaches the platform
fn reject<T>(reply: Reply<T>, error: BleError) {
    debug!("Rejected: {}", error);
    let _ = reply.send(Err(error));
}

/// Busy check, platform request, then registration. The request is issued
/// before registering so a refused request never leaves a waiter behind.
fn dispatch<T>(
    table: &mut PendingTable<T>,
    timers: &Timers,
    key: PendingKey,
    timeout: Duration,
    reply: Reply<T>,
    request: impl FnOnce() -> Result<(), BleError>,
) {
    if let Err(busy) = table.ensure_idle(&key) {
        return reject(reply, busy);
    }
    if let Err(e) = request() {
        warn!("Platform refused {}: {}", key, e);
        let _ = reply.send(Err(e));
        return;
    }
    table.register(key, reply, timeout, timers);
}

type SubscriptionKey = (String, CharacteristicRef);

pub(crate) struct CentralManager {
    platform: Arc<dyn BlePlatform>,
    config: CentralConfig,
    timers: Timers,
    events: broadcast::Sender<CentralEvent>,
    adapter: AdapterState,
    registry: PeripheralRegistry,
    scan: ScanController,
    connects: PendingTable<()>,
    discoveries: PendingTable<ServiceTree>,
    reads: PendingTable<Vec<u8>>,
    rssi_reads: PendingTable<i16>,
    subscribes: PendingTable<NotificationStream>,
    unsubscribes: PendingTable<()>,
    writes: WriteQueues,
    paced_writes: PacedWrites,
    subscriptions: HashMap<SubscriptionKey, mpsc::UnboundedSender<Notification>>,
    /// Peripherals in `Disconnecting`, waiting for the platform to confirm
    disconnecting: HashMap<String, (u64, TimerGuard)>,
    next_disconnect: u64,
}

impl CentralManager {
    pub(crate) fn new(
        platform: Arc<dyn BlePlatform>,
        config: CentralConfig,
        timers: Timers,
        events: broadcast::Sender<CentralEvent>,
    ) -> Self {
        let writes = WriteQueues::new(config.max_queued_writes);
        let paced_writes =
            PacedWrites::new(config.write_without_response_interval().unwrap_or_default());
        Self {
            platform,
            config,
            timers,
            events,
            adapter: AdapterState::Unknown,
            registry: PeripheralRegistry::new(),
            scan: ScanController::new(),
            connects: PendingTable::new(OperationKind::Connect),
            discoveries: PendingTable::new(OperationKind::DiscoverServices),
            reads: PendingTable::new(OperationKind::Read),
            rssi_reads: PendingTable::new(OperationKind::ReadRssi),
            subscribes: PendingTable::new(OperationKind::Subscribe),
            unsubscribes: PendingTable::new(OperationKind::Unsubscribe),
            writes,
            paced_writes,
            subscriptions: HashMap::new(),
            disconnecting: HashMap::new(),
            next_disconnect: 0,
        }
    }

    /// Main loop; returns once a shutdown command arrives or every handle is
    /// gone
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut platform_events: PlatformEvents,
        mut timer_events: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        info!("Central manager started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("All handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = platform_events.rx.recv() => self.handle_platform_event(event),
                Some(timer) = timer_events.recv() => self.handle_timer(timer),
            }
        }
        info!("Central manager stopped");
    }

    fn emit(&self, event: CentralEvent) {
        debug!("Event: {}", event);
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Returns false when the loop should stop
    pub(crate) fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartScan {
                filters,
                timeout,
                reply,
            } => self.start_scan(filters, timeout, reply),
            Command::StopScan { reply } => self.stop_scan(reply),
            Command::IsScanning { reply } => {
                let _ = reply.send(Ok(self.scan.is_scanning()));
            }
            Command::Connect {
                peripheral,
                timeout,
                reply,
            } => self.connect(peripheral, timeout, reply),
            Command::Disconnect { peripheral, reply } => self.disconnect(peripheral, reply),
            Command::DiscoverServices { peripheral, reply } => {
                self.discover_services(peripheral, reply)
            }
            Command::Read {
                peripheral,
                characteristic,
                reply,
            } => self.read(peripheral, characteristic, reply),
            Command::Write {
                peripheral,
                characteristic,
                data,
                write_type,
                reply,
            } => self.write(peripheral, characteristic, data, write_type, reply),
            Command::ReadRssi { peripheral, reply } => self.read_rssi(peripheral, reply),
            Command::Subscribe {
                peripheral,
                characteristic,
                reply,
            } => self.subscribe(peripheral, characteristic, reply),
            Command::Unsubscribe {
                peripheral,
                characteristic,
                reply,
            } => self.unsubscribe(peripheral, characteristic, reply),
            Command::GetPeripheral { peripheral, reply } => {
                let _ = reply.send(self.registry.get(&peripheral).map(|p| p.snapshot()));
            }
            Command::DiscoveredPeripherals { reply } => {
                let _ = reply.send(Ok(self.registry.iter().map(|p| p.snapshot()).collect()));
            }
            Command::ConnectedPeripherals { services, reply } => {
                let _ = reply.send(Ok(self.connected_peripherals(&services)));
            }
            Command::RemovePeripheral { peripheral, reply } => {
                let _ = reply.send(self.remove_peripheral(&peripheral));
            }
            Command::AdapterState { reply } => {
                self.emit(CentralEvent::AdapterStateChanged(self.adapter));
                let _ = reply.send(Ok(self.adapter));
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn ensure_adapter_usable(&self) -> Result<(), BleError> {
        if self.adapter.is_usable() {
            Ok(())
        } else {
            Err(BleError::InvalidState(format!("adapter is {}", self.adapter)))
        }
    }

    fn ensure_connected(&self, id: &str) -> Result<(), BleError> {
        let peripheral = self.registry.get(id)?;
        if !peripheral.is_connected() {
            return Err(BleError::InvalidState(format!(
                "peripheral {} is {}",
                id, peripheral.state
            )));
        }
        Ok(())
    }

    /// Connected peripheral plus a discovered characteristic
    fn lookup(&self, id: &str, target: &CharacteristicRef) -> Result<&Characteristic, BleError> {
        self.ensure_connected(id)?;
        self.registry
            .get(id)?
            .characteristic(target)
            .ok_or_else(|| BleError::NotFound(format!("characteristic {} on {}", target, id)))
    }

    fn set_subscription(&mut self, id: &str, target: &CharacteristicRef, state: SubscriptionState) {
        if let Some(characteristic) = self
            .registry
            .get_mut(id)
            .ok()
            .and_then(|p| p.characteristic_mut(target))
        {
            characteristic.subscription = state;
        }
    }

    fn subscription_state(&self, id: &str, target: &CharacteristicRef) -> Option<SubscriptionState> {
        self.registry
            .get(id)
            .ok()
            .and_then(|p| p.characteristic(target))
            .map(|c| c.subscription)
    }

    fn start_scan(&mut self, filters: Vec<Uuid>, timeout: Option<Duration>, reply: Reply<()>) {
        if let Err(e) = self.ensure_adapter_usable() {
            return reject(reply, e);
        }

        if self.config.clear_stale_on_scan {
            let removed = self.registry.retain(|p| p.state.is_linked());
            if !removed.is_empty() {
                debug!("Forgot {} stale peripherals", removed.len());
            }
        }

        let result = self
            .scan
            .start(filters, timeout, self.platform.as_ref(), &self.timers)
            .map(|outcome| {
                if outcome == ScanStart::Replaced {
                    debug!("Previous scan session replaced");
                }
                if let Some(deadline) = self.scan.session().and_then(|s| s.deadline) {
                    debug!("Scan auto-stops at {:?}", deadline);
                }
            });
        let _ = reply.send(result);
    }

    fn stop_scan(&mut self, reply: Reply<()>) {
        let result = match self.scan.stop(self.platform.as_ref()) {
            Ok(true) => {
                self.emit(CentralEvent::ScanStopped);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                // The session is gone either way
                self.emit(CentralEvent::ScanStopped);
                Err(e)
            }
        };
        let _ = reply.send(result);
    }

    fn connect(&mut self, id: String, timeout: Option<Duration>, reply: Reply<()>) {
        if let Err(e) = self.ensure_adapter_usable() {
            return reject(reply, e);
        }
        let state = match self.registry.get(&id) {
            Ok(peripheral) => peripheral.state,
            Err(e) => return reject(reply, e),
        };
        let key = PendingKey::peripheral(&id, OperationKind::Connect);
        if let Err(busy) = self.connects.ensure_idle(&key) {
            return reject(reply, busy);
        }
        if !state.can_connect() {
            return reject(
                reply,
                BleError::InvalidState(format!("peripheral {} is {}", id, state)),
            );
        }

        let timeout = timeout.unwrap_or_else(|| self.config.connect_timeout());
        let platform = &self.platform;
        dispatch(&mut self.connects, &self.timers, key.clone(), timeout, reply, || {
            platform.connect(&id)
        });
        if self.connects.contains(&key) {
            info!(peripheral = %id, "Connecting (timeout {:?})", timeout);
            let _ = self
                .registry
                .set_connection_state(&id, ConnectionState::Connecting);
        }
    }

    fn disconnect(&mut self, id: String, reply: Reply<()>) {
        let state = match self.registry.get(&id) {
            Ok(peripheral) => peripheral.state,
            Err(e) => return reject(reply, e),
        };
        match state {
            ConnectionState::Discovered
            | ConnectionState::Disconnected
            | ConnectionState::Disconnecting => {
                debug!(peripheral = %id, "Disconnect while {}; nothing to do", state);
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Err(e) = self.platform.disconnect(&id) {
                    let _ = reply.send(Err(e));
                    return;
                }
                info!(peripheral = %id, "Disconnecting");
                let _ = self
                    .registry
                    .set_connection_state(&id, ConnectionState::Disconnecting);
                self.next_disconnect += 1;
                let deadline = self.timers.schedule(
                    self.config.operation_timeout(),
                    TimerEvent::DisconnectExpired {
                        peripheral: id.clone(),
                        id: self.next_disconnect,
                    },
                );
                self.disconnecting
                    .insert(id.clone(), (self.next_disconnect, deadline));
                let failed = self.fail_peripheral(
                    &id,
                    &BleError::Disconnected(format!("{} disconnect requested", id)),
                );
                if failed > 0 {
                    debug!(peripheral = %id, "Cancelled {} outstanding operations", failed);
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn discover_services(&mut self, id: String, reply: Reply<ServiceTree>) {
        if let Err(e) = self.ensure_connected(&id) {
            return reject(reply, e);
        }
        let key = PendingKey::peripheral(&id, OperationKind::DiscoverServices);
        let timeout = self.config.operation_timeout();
        let platform = &self.platform;
        dispatch(&mut self.discoveries, &self.timers, key, timeout, reply, || {
            platform.discover_services(&id)
        });
    }

    fn read(&mut self, id: String, target: CharacteristicRef, reply: Reply<Vec<u8>>) {
        let checked = self.lookup(&id, &target).and_then(|c| {
            if c.properties.read {
                Ok(())
            } else {
                Err(BleError::CapabilityMismatch(format!(
                    "characteristic {} is not readable",
                    target
                )))
            }
        });
        if let Err(e) = checked {
            return reject(reply, e);
        }

        let key = PendingKey::characteristic(&id, OperationKind::Read, target);
        let timeout = self.config.operation_timeout();
        let platform = &self.platform;
        dispatch(&mut self.reads, &self.timers, key, timeout, reply, || {
            platform.read(&id, &target)
        });
    }

    fn write(
        &mut self,
        id: String,
        target: CharacteristicRef,
        data: Vec<u8>,
        write_type: WriteType,
        reply: Reply<()>,
    ) {
        let checked = self.lookup(&id, &target).and_then(|c| {
            if c.properties.supports_write(write_type) {
                Ok(())
            } else {
                Err(BleError::CapabilityMismatch(format!(
                    "characteristic {} does not support {} writes",
                    target, write_type
                )))
            }
        });
        if let Err(e) = checked {
            return reject(reply, e);
        }

        match write_type {
            WriteType::WithResponse => {
                let task = WriteTask::new(target, data, self.config.write_chunk_size, reply);
                let ctx = DispatchContext {
                    platform: self.platform.as_ref(),
                    timers: &self.timers,
                    timeout: self.config.operation_timeout(),
                };
                self.writes.enqueue(&id, task, &ctx);
                debug!(peripheral = %id, "{} acknowledged writes queued", self.writes.queued(&id));
            }
            WriteType::WithoutResponse if self.config.write_without_response_interval().is_some() => {
                let write = PacedWrite::new(target, data, self.config.write_chunk_size, reply);
                let ctx = DispatchContext {
                    platform: self.platform.as_ref(),
                    timers: &self.timers,
                    timeout: self.config.operation_timeout(),
                };
                self.paced_writes.submit(&id, write, &ctx);
            }
            WriteType::WithoutResponse => {
                let result = chunk_payload(data, self.config.write_chunk_size)
                    .iter()
                    .try_for_each(|chunk| {
                        self.platform
                            .write(&id, &target, chunk, WriteType::WithoutResponse)
                    });
                let _ = reply.send(result);
            }
        }
    }

    fn read_rssi(&mut self, id: String, reply: Reply<i16>) {
        if let Err(e) = self.ensure_connected(&id) {
            return reject(reply, e);
        }
        let key = PendingKey::peripheral(&id, OperationKind::ReadRssi);
        let timeout = self.config.operation_timeout();
        let platform = &self.platform;
        dispatch(&mut self.rssi_reads, &self.timers, key, timeout, reply, || {
            platform.read_rssi(&id)
        });
    }

    fn subscribe(&mut self, id: String, target: CharacteristicRef, reply: Reply<NotificationStream>) {
        let checked = self.lookup(&id, &target).and_then(|c| {
            if !c.properties.is_notifiable() {
                return Err(BleError::CapabilityMismatch(format!(
                    "characteristic {} does not notify",
                    target
                )));
            }
            match c.subscription {
                SubscriptionState::Unsubscribed => Ok(()),
                SubscriptionState::Subscribed => Err(BleError::InvalidState(format!(
                    "already subscribed to {}",
                    target
                ))),
                SubscriptionState::Subscribing | SubscriptionState::Unsubscribing => Err(
                    BleError::Busy(format!("subscription change on {} in progress", target)),
                ),
            }
        });
        if let Err(e) = checked {
            return reject(reply, e);
        }

        let key = PendingKey::characteristic(&id, OperationKind::Subscribe, target);
        let timeout = self.config.operation_timeout();
        let platform = &self.platform;
        dispatch(&mut self.subscribes, &self.timers, key.clone(), timeout, reply, || {
            platform.set_notify(&id, &target, true)
        });
        if self.subscribes.contains(&key) {
            self.set_subscription(&id, &target, SubscriptionState::Subscribing);
        }
    }

    fn unsubscribe(&mut self, id: String, target: CharacteristicRef, reply: Reply<()>) {
        let checked = self.lookup(&id, &target).and_then(|c| match c.subscription {
            SubscriptionState::Subscribed => Ok(()),
            SubscriptionState::Unsubscribed => Err(BleError::InvalidState(format!(
                "not subscribed to {}",
                target
            ))),
            SubscriptionState::Subscribing | SubscriptionState::Unsubscribing => Err(
                BleError::Busy(format!("subscription change on {} in progress", target)),
            ),
        });
        if let Err(e) = checked {
            return reject(reply, e);
        }

        let key = PendingKey::characteristic(&id, OperationKind::Unsubscribe, target);
        let timeout = self.config.operation_timeout();
        let platform = &self.platform;
        dispatch(&mut self.unsubscribes, &self.timers, key.clone(), timeout, reply, || {
            platform.set_notify(&id, &target, false)
        });
        if self.unsubscribes.contains(&key) {
            // Delivery stops now, not when the platform acknowledges
            self.set_subscription(&id, &target, SubscriptionState::Unsubscribing);
        }
    }

    fn connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo> {
        self.registry
            .iter()
            .filter(|p| p.is_connected())
            .filter(|p| services.is_empty() || services.iter().any(|s| p.has_service(s)))
            .map(|p| p.snapshot())
            .collect()
    }

    fn remove_peripheral(&mut self, id: &str) -> Result<(), BleError> {
        let state = self.registry.get(id)?.state;
        if state.is_linked() {
            return Err(BleError::InvalidState(format!(
                "peripheral {} is {}; disconnect first",
                id, state
            )));
        }
        self.close_subscriptions(id);
        self.registry.remove(id);
        info!(peripheral = %id, "Peripheral removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cascades
    // ------------------------------------------------------------------

    fn close_subscriptions(&mut self, id: &str) {
        self.subscriptions.retain(|(peripheral, _), _| peripheral != id);
    }

    /// Fail everything outstanding for `id`, end its notification streams and
    /// reset subscription state. Returns how many operations were failed.
    fn fail_peripheral(&mut self, id: &str, error: &BleError) -> usize {
        let failed = self.connects.fail_peripheral(id, error)
            + self.discoveries.fail_peripheral(id, error)
            + self.reads.fail_peripheral(id, error)
            + self.rssi_reads.fail_peripheral(id, error)
            + self.subscribes.fail_peripheral(id, error)
            + self.unsubscribes.fail_peripheral(id, error)
            + self.writes.fail_peripheral(id, error)
            + self.paced_writes.fail_peripheral(id, error);

        self.close_subscriptions(id);
        if let Ok(peripheral) = self.registry.get_mut(id) {
            for service in peripheral.services.iter_mut() {
                for characteristic in service.characteristics.iter_mut() {
                    characteristic.subscription = SubscriptionState::Unsubscribed;
                }
            }
        }
        failed
    }

    /// Link to `id` is gone (platform report, adapter loss)
    fn link_lost(&mut self, id: &str, error: Option<String>) {
        let Ok(peripheral) = self.registry.get_mut(id) else {
            debug!(peripheral = %id, "Disconnect for unknown peripheral ignored");
            return;
        };
        let previous = peripheral.state;
        peripheral.state = ConnectionState::Disconnected;
        peripheral.reset_discovery();
        self.disconnecting.remove(id);

        let connect_key = PendingKey::peripheral(id, OperationKind::Connect);
        if self.connects.contains(&connect_key) {
            let reason = match &error {
                Some(reason) => BleError::Platform(reason.clone()),
                None => BleError::Disconnected(format!("{} dropped while connecting", id)),
            };
            self.connects.resolve(&connect_key, Err(reason));
        }

        let failed = self.fail_peripheral(id, &BleError::Disconnected(format!("{} disconnected", id)));
        match &error {
            Some(reason) => warn!(peripheral = %id, "Link lost ({}), {} operations failed", reason, failed),
            None => info!(peripheral = %id, "Disconnected, {} operations failed", failed),
        }

        if previous.is_linked() {
            self.emit(CentralEvent::PeripheralDisconnected {
                peripheral: id.to_string(),
                error,
            });
        }
    }

    fn shutdown(&mut self) {
        let error = BleError::NotRunning;
        let failed = self.connects.fail_all(&error)
            + self.discoveries.fail_all(&error)
            + self.reads.fail_all(&error)
            + self.rssi_reads.fail_all(&error)
            + self.subscribes.fail_all(&error)
            + self.unsubscribes.fail_all(&error)
            + self.writes.fail_all(&error)
            + self.paced_writes.fail_all(&error);
        self.subscriptions.clear();
        self.disconnecting.clear();
        if let Err(e) = self.scan.stop(self.platform.as_ref()) {
            debug!("stop_scan during shutdown failed: {}", e);
        }
        info!("Central manager shutting down ({} operations failed)", failed);
    }

    // ------------------------------------------------------------------
    // Platform events
    // ------------------------------------------------------------------

    pub(crate) fn handle_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            PlatformEvent::PeripheralDiscovered {
                peripheral,
                name,
                rssi,
                advertisement,
            } => {
                let record = self.registry.upsert(&peripheral);
                if name.is_some() {
                    record.name = name;
                }
                if rssi.is_some() {
                    record.rssi = rssi;
                }
                record.advertisement = advertisement;
                let snapshot = record.snapshot();
                self.emit(CentralEvent::PeripheralDiscovered(snapshot));
            }
            PlatformEvent::Connected { peripheral } => self.on_connected(&peripheral),
            PlatformEvent::Disconnected { peripheral, error } => self.link_lost(&peripheral, error),
            PlatformEvent::ServicesDiscovered { peripheral, result } => {
                let key = PendingKey::peripheral(&peripheral, OperationKind::DiscoverServices);
                if !self.discoveries.contains(&key) {
                    debug!(peripheral = %peripheral, "Unsolicited service discovery result dropped");
                    return;
                }
                let outcome = match result {
                    Ok(tree) => self
                        .registry
                        .record_services(&peripheral, tree)
                        .map(|services| services.to_vec()),
                    Err(reason) => Err(BleError::Platform(reason)),
                };
                self.discoveries.resolve(&key, outcome);
            }
            PlatformEvent::CharacteristicValueUpdated {
                peripheral,
                characteristic,
                value,
                for_read: true,
            } => {
                let key = PendingKey::characteristic(&peripheral, OperationKind::Read, characteristic);
                self.reads.resolve(&key, value.map_err(BleError::Platform));
            }
            PlatformEvent::CharacteristicValueUpdated {
                peripheral,
                characteristic,
                value,
                for_read: false,
            } => match value {
                Ok(value) => self.deliver_notification(peripheral, characteristic, value),
                Err(reason) => {
                    warn!(peripheral = %peripheral, "Notification error on {}: {}", characteristic, reason)
                }
            },
            PlatformEvent::WriteConfirmed {
                peripheral,
                characteristic,
                result,
            } => {
                let ctx = DispatchContext {
                    platform: self.platform.as_ref(),
                    timers: &self.timers,
                    timeout: self.config.operation_timeout(),
                };
                self.writes
                    .on_write_result(&peripheral, &characteristic, result, &ctx);
            }
            PlatformEvent::NotifyStateChanged {
                peripheral,
                characteristic,
                result,
            } => self.on_notify_state(&peripheral, characteristic, result),
            PlatformEvent::RssiRead { peripheral, result } => {
                if let (Ok(rssi), Ok(record)) = (&result, self.registry.get_mut(&peripheral)) {
                    record.rssi = Some(*rssi);
                }
                let key = PendingKey::peripheral(&peripheral, OperationKind::ReadRssi);
                self.rssi_reads.resolve(&key, result.map_err(BleError::Platform));
            }
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        let previous = std::mem::replace(&mut self.adapter, state);
        if previous != state {
            info!("Adapter {} -> {}", previous, state);
        }
        self.emit(CentralEvent::AdapterStateChanged(state));

        if state.is_usable() {
            return;
        }
        if self.scan.abandon() {
            self.emit(CentralEvent::ScanStopped);
        }
        let linked: Vec<String> = self
            .registry
            .iter()
            .filter(|p| p.state.is_linked())
            .map(|p| p.id.clone())
            .collect();
        for id in linked {
            self.link_lost(&id, Some(format!("adapter {}", state)));
        }
    }

    fn on_connected(&mut self, id: &str) {
        let state = match self.registry.get(id) {
            Ok(peripheral) => peripheral.state,
            Err(_) => {
                warn!(peripheral = %id, "Connected event for unknown peripheral");
                return;
            }
        };
        match state {
            ConnectionState::Connecting => {
                let _ = self
                    .registry
                    .set_connection_state(id, ConnectionState::Connected);
                info!(peripheral = %id, "Connected");
                self.connects.resolve(
                    &PendingKey::peripheral(id, OperationKind::Connect),
                    Ok(()),
                );
                self.emit(CentralEvent::PeripheralConnected {
                    peripheral: id.to_string(),
                });
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                debug!(peripheral = %id, "Connected event while {} ignored", state);
            }
            ConnectionState::Discovered | ConnectionState::Disconnected => {
                // Connect already timed out; release the link the platform made
                warn!(peripheral = %id, "Late connection dropped");
                if let Err(e) = self.platform.disconnect(id) {
                    debug!(peripheral = %id, "Releasing late connection failed: {}", e);
                }
            }
        }
    }

    fn deliver_notification(&mut self, id: String, target: CharacteristicRef, value: Vec<u8>) {
        if self.subscription_state(&id, &target) != Some(SubscriptionState::Subscribed) {
            debug!(peripheral = %id, "Notification on {} without active subscription dropped", target);
            return;
        }
        let key = (id, target);
        let Some(sender) = self.subscriptions.get(&key) else {
            return;
        };
        let notification = Notification {
            peripheral: key.0.clone(),
            characteristic: target,
            value,
        };
        if sender.send(notification).is_err() {
            // Subscriber dropped its stream
            let (id, target) = key;
            debug!(peripheral = %id, "Stream for {} closed; disabling notifications", target);
            self.subscriptions.remove(&(id.clone(), target));
            self.set_subscription(&id, &target, SubscriptionState::Unsubscribed);
            if let Err(e) = self.platform.set_notify(&id, &target, false) {
                debug!(peripheral = %id, "Disabling notifications failed: {}", e);
            }
        }
    }

    fn on_notify_state(&mut self, id: &str, target: CharacteristicRef, result: Result<bool, String>) {
        let subscribe_key = PendingKey::characteristic(id, OperationKind::Subscribe, target);
        let unsubscribe_key = PendingKey::characteristic(id, OperationKind::Unsubscribe, target);

        match result {
            Ok(true) if self.subscribes.contains(&subscribe_key) => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.subscriptions.insert((id.to_string(), target), tx);
                self.set_subscription(id, &target, SubscriptionState::Subscribed);
                info!(peripheral = %id, "Subscribed to {}", target);
                self.subscribes
                    .resolve(&subscribe_key, Ok(NotificationStream::new(rx)));
            }
            Ok(true) => {
                if self.subscription_state(id, &target) == Some(SubscriptionState::Unsubscribed) {
                    // Subscribe already timed out; undo it at the platform
                    debug!(peripheral = %id, "Late subscribe ack for {}; disabling", target);
                    if let Err(e) = self.platform.set_notify(id, &target, false) {
                        debug!(peripheral = %id, "Disabling notifications failed: {}", e);
                    }
                }
            }
            Ok(false) if self.unsubscribes.contains(&unsubscribe_key) => {
                self.subscriptions.remove(&(id.to_string(), target));
                self.set_subscription(id, &target, SubscriptionState::Unsubscribed);
                info!(peripheral = %id, "Unsubscribed from {}", target);
                self.unsubscribes.resolve(&unsubscribe_key, Ok(()));
            }
            Ok(false) => {
                debug!(peripheral = %id, "Unsolicited notify-off for {} dropped", target);
            }
            Err(reason) => {
                if self.subscribes.contains(&subscribe_key) {
                    self.set_subscription(id, &target, SubscriptionState::Unsubscribed);
                    self.subscribes
                        .resolve(&subscribe_key, Err(BleError::Platform(reason)));
                } else if self.unsubscribes.contains(&unsubscribe_key) {
                    self.set_subscription(id, &target, SubscriptionState::Subscribed);
                    self.unsubscribes
                        .resolve(&unsubscribe_key, Err(BleError::Platform(reason)));
                } else {
                    debug!(peripheral = %id, "Notify-state error for {} dropped: {}", target, reason);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------

    pub(crate) fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::OperationExpired { key, id } => self.on_operation_expired(key, id),
            TimerEvent::WriteExpired {
                peripheral,
                dispatch,
            } => {
                let ctx = DispatchContext {
                    platform: self.platform.as_ref(),
                    timers: &self.timers,
                    timeout: self.config.operation_timeout(),
                };
                if self.writes.on_timeout(&peripheral, dispatch, &ctx) {
                    warn!(peripheral = %peripheral, "Acknowledged write timed out");
                }
            }
            TimerEvent::ScanExpired { session } => {
                if self.scan.on_expired(session, self.platform.as_ref()) {
                    info!("Scan {} reached its deadline", session);
                    self.emit(CentralEvent::ScanStopped);
                }
            }
            TimerEvent::DisconnectExpired { peripheral, id } => {
                if self.disconnecting.get(&peripheral).map(|(current, _)| *current) != Some(id) {
                    return;
                }
                warn!(peripheral = %peripheral, "Platform never confirmed disconnect; treating link as closed");
                self.link_lost(&peripheral, None);
            }
            TimerEvent::PacedWriteDue { peripheral, tick } => {
                let ctx = DispatchContext {
                    platform: self.platform.as_ref(),
                    timers: &self.timers,
                    timeout: self.config.operation_timeout(),
                };
                self.paced_writes.on_due(&peripheral, tick, &ctx);
            }
        }
    }

    fn on_operation_expired(&mut self, key: PendingKey, id: u64) {
        let expired = match key.kind {
            OperationKind::Connect => self.connects.expire(&key, id),
            OperationKind::DiscoverServices => self.discoveries.expire(&key, id),
            OperationKind::Read => self.reads.expire(&key, id),
            OperationKind::ReadRssi => self.rssi_reads.expire(&key, id),
            OperationKind::Subscribe => self.subscribes.expire(&key, id),
            OperationKind::Unsubscribe => self.unsubscribes.expire(&key, id),
        };
        if !expired {
            return;
        }
        warn!("{} timed out", key);

        let peripheral = key.peripheral.as_str();
        match (key.kind, key.characteristic) {
            (OperationKind::Connect, _) => {
                let _ = self
                    .registry
                    .set_connection_state(peripheral, ConnectionState::Disconnected);
                if let Err(e) = self.platform.disconnect(peripheral) {
                    debug!(peripheral = %peripheral, "Cancelling connect failed: {}", e);
                }
            }
            (OperationKind::Subscribe, Some(target)) => {
                self.set_subscription(peripheral, &target, SubscriptionState::Unsubscribed)
            }
            (OperationKind::Unsubscribe, Some(target)) => {
                self.set_subscription(peripheral, &target, SubscriptionState::Subscribed)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::platform::MockBlePlatform;
    use crate::gatt::{from_short, CharacteristicProperties, Service};
    use tokio::sync::oneshot;

    const DEV: &str = "AA:BB:CC:DD:EE:01";

    fn heart_rate() -> CharacteristicRef {
        CharacteristicRef::new(from_short(0x180D), from_short(0x2A37))
    }

    fn control_point() -> CharacteristicRef {
        CharacteristicRef::new(from_short(0x180D), from_short(0x2A39))
    }

    fn body_location() -> CharacteristicRef {
        CharacteristicRef::new(from_short(0x180D), from_short(0x2A38))
    }

    fn manager(platform: MockBlePlatform) -> (CentralManager, broadcast::Receiver<CentralEvent>) {
        let (timers, _timer_rx) = Timers::new();
        let (events, events_rx) = broadcast::channel(64);
        let manager = CentralManager::new(Arc::new(platform), CentralConfig::default(), timers, events);
        (manager, events_rx)
    }

    /// Put `DEV` straight into the connected state with a heart-rate service
    fn connect_directly(manager: &mut CentralManager) {
        let peripheral = manager.registry.upsert(DEV);
        peripheral.state = ConnectionState::Connected;
        peripheral.merge_services(vec![Service::new(from_short(0x180D))
            .with_characteristic(
                heart_rate().characteristic,
                CharacteristicProperties::default().with_notify(),
            )
            .with_characteristic(body_location().characteristic, CharacteristicProperties::readable())
            .with_characteristic(
                control_point().characteristic,
                CharacteristicProperties::default().with_write(),
            )]);
    }

    fn call<T>(
        manager: &mut CentralManager,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> oneshot::Receiver<Result<T, BleError>> {
        let (tx, rx) = oneshot::channel();
        assert!(manager.handle_command(make(tx)));
        rx
    }

    #[tokio::test]
    async fn test_validation_failures_never_reach_platform() {
        // No expectations: any platform call panics
        let (mut manager, _events) = manager(MockBlePlatform::new());

        let rx = call(&mut manager, |reply| Command::Read {
            peripheral: DEV.into(),
            characteristic: body_location(),
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::NotFound(_))));

        manager.registry.upsert(DEV);
        let rx = call(&mut manager, |reply| Command::Read {
            peripheral: DEV.into(),
            characteristic: body_location(),
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::InvalidState(_))));

        connect_directly(&mut manager);
        let rx = call(&mut manager, |reply| Command::Write {
            peripheral: DEV.into(),
            characteristic: body_location(),
            data: vec![1],
            write_type: WriteType::WithResponse,
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::CapabilityMismatch(_))));

        let rx = call(&mut manager, |reply| Command::Subscribe {
            peripheral: DEV.into(),
            characteristic: control_point(),
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::CapabilityMismatch(_))));

        let rx = call(&mut manager, |reply| Command::Unsubscribe {
            peripheral: DEV.into(),
            characteristic: heart_rate(),
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::InvalidState(_))));

        let rx = call(&mut manager, |reply| Command::Connect {
            peripheral: DEV.into(),
            timeout: None,
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_duplicate_read_is_busy() {
        let mut platform = MockBlePlatform::new();
        platform.expect_read().times(1).returning(|_, _| Ok(()));
        let (mut manager, _events) = manager(platform);
        connect_directly(&mut manager);

        let first = call(&mut manager, |reply| Command::Read {
            peripheral: DEV.into(),
            characteristic: body_location(),
            reply,
        });
        let second = call(&mut manager, |reply| Command::Read {
            peripheral: DEV.into(),
            characteristic: body_location(),
            reply,
        });
        assert!(matches!(second.await.expect("reply"), Err(BleError::Busy(_))));

        manager.handle_platform_event(PlatformEvent::CharacteristicValueUpdated {
            peripheral: DEV.into(),
            characteristic: body_location(),
            value: Ok(vec![0x01]),
            for_read: true,
        });
        assert_eq!(first.await.expect("reply"), Ok(vec![0x01]));
    }

    #[tokio::test]
    async fn test_write_without_response_bypasses_queue() {
        let mut platform = MockBlePlatform::new();
        platform
            .expect_write()
            .withf(|_, _, _, write_type| matches!(write_type, WriteType::WithoutResponse))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (mut manager, _events) = manager(platform);
        connect_directly(&mut manager);
        manager
            .registry
            .get_mut(DEV)
            .expect("known")
            .characteristic_mut(&control_point())
            .expect("present")
            .properties = CharacteristicProperties::default().with_write_without_response();

        let rx = call(&mut manager, |reply| Command::Write {
            peripheral: DEV.into(),
            characteristic: control_point(),
            data: vec![0xAA],
            write_type: WriteType::WithoutResponse,
            reply,
        });
        assert_eq!(rx.await.expect("reply"), Ok(()));
        assert_eq!(manager.writes.queued(DEV), 0);
    }

    #[tokio::test]
    async fn test_platform_disconnect_cascades() {
        let mut platform = MockBlePlatform::new();
        platform.expect_write().times(1).returning(|_, _, _, _| Ok(()));
        platform.expect_read().times(1).returning(|_, _| Ok(()));
        let (mut manager, mut events) = manager(platform);
        connect_directly(&mut manager);

        let writes: Vec<_> = (0..3u8)
            .map(|byte| {
                call(&mut manager, |reply| Command::Write {
                    peripheral: DEV.into(),
                    characteristic: control_point(),
                    data: vec![byte],
                    write_type: WriteType::WithResponse,
                    reply,
                })
            })
            .collect();
        let read = call(&mut manager, |reply| Command::Read {
            peripheral: DEV.into(),
            characteristic: body_location(),
            reply,
        });

        manager.handle_platform_event(PlatformEvent::Disconnected {
            peripheral: DEV.into(),
            error: Some("connection timeout (8)".into()),
        });

        for rx in writes {
            assert!(matches!(rx.await.expect("reply"), Err(BleError::Disconnected(_))));
        }
        assert!(matches!(read.await.expect("reply"), Err(BleError::Disconnected(_))));
        assert_eq!(manager.writes.queued(DEV), 0);

        let peripheral = manager.registry.get(DEV).expect("kept");
        assert_eq!(peripheral.state, ConnectionState::Disconnected);
        assert!(!peripheral.services_known());
        assert_eq!(
            events.try_recv().expect("event"),
            CentralEvent::PeripheralDisconnected {
                peripheral: DEV.into(),
                error: Some("connection timeout (8)".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_failed_connect_reports_platform_reason() {
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().times(1).returning(|_| Ok(()));
        let (mut manager, _events) = manager(platform);
        manager.registry.upsert(DEV);

        let rx = call(&mut manager, |reply| Command::Connect {
            peripheral: DEV.into(),
            timeout: Some(Duration::from_secs(5)),
            reply,
        });
        assert_eq!(
            manager.registry.get(DEV).expect("known").state,
            ConnectionState::Connecting
        );

        manager.handle_platform_event(PlatformEvent::Disconnected {
            peripheral: DEV.into(),
            error: Some("GATT 133".into()),
        });
        assert_eq!(
            rx.await.expect("reply"),
            Err(BleError::Platform("GATT 133".into()))
        );
        assert_eq!(
            manager.registry.get(DEV).expect("known").state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_adapter_off_blocks_radio_operations() {
        let (mut manager, mut events) = manager(MockBlePlatform::new());
        manager.handle_platform_event(PlatformEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(
            events.try_recv().expect("event"),
            CentralEvent::AdapterStateChanged(AdapterState::PoweredOff)
        );

        let rx = call(&mut manager, |reply| Command::StartScan {
            filters: vec![],
            timeout: None,
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_notifications_stop_at_unsubscribe() {
        let mut platform = MockBlePlatform::new();
        platform.expect_set_notify().times(2).returning(|_, _, _| Ok(()));
        let (mut manager, _events) = manager(platform);
        connect_directly(&mut manager);

        let rx = call(&mut manager, |reply| Command::Subscribe {
            peripheral: DEV.into(),
            characteristic: heart_rate(),
            reply,
        });
        manager.handle_platform_event(PlatformEvent::NotifyStateChanged {
            peripheral: DEV.into(),
            characteristic: heart_rate(),
            result: Ok(true),
        });
        let mut stream = rx.await.expect("reply").expect("subscribed");

        let notify = |value: u8| PlatformEvent::CharacteristicValueUpdated {
            peripheral: DEV.into(),
            characteristic: heart_rate(),
            value: Ok(vec![value]),
            for_read: false,
        };
        manager.handle_platform_event(notify(1));

        let unsubscribed = call(&mut manager, |reply| Command::Unsubscribe {
            peripheral: DEV.into(),
            characteristic: heart_rate(),
            reply,
        });
        manager.handle_platform_event(notify(2));
        manager.handle_platform_event(PlatformEvent::NotifyStateChanged {
            peripheral: DEV.into(),
            characteristic: heart_rate(),
            result: Ok(false),
        });
        assert_eq!(unsubscribed.await.expect("reply"), Ok(()));

        assert_eq!(stream.recv().await.map(|n| n.value), Some(vec![1]));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_connected_peripheral_rejected() {
        let (mut manager, _events) = manager(MockBlePlatform::new());
        connect_directly(&mut manager);
        let rx = call(&mut manager, |reply| Command::RemovePeripheral {
            peripheral: DEV.into(),
            reply,
        });
        assert!(matches!(rx.await.expect("reply"), Err(BleError::InvalidState(_))));

        manager.registry.upsert("idle");
        let rx = call(&mut manager, |reply| Command::RemovePeripheral {
            peripheral: "idle".into(),
            reply,
        });
        assert_eq!(rx.await.expect("reply"), Ok(()));
        assert!(!manager.registry.contains("idle"));
    }

    #[tokio::test]
    async fn test_disconnect_deadline_closes_link() {
        let mut platform = MockBlePlatform::new();
        platform.expect_disconnect().times(1).returning(|_| Ok(()));
        let (mut manager, mut events) = manager(platform);
        connect_directly(&mut manager);

        let rx = call(&mut manager, |reply| Command::Disconnect {
            peripheral: DEV.into(),
            reply,
        });
        assert_eq!(rx.await.expect("reply"), Ok(()));
        assert_eq!(
            manager.registry.get(DEV).expect("known").state,
            ConnectionState::Disconnecting
        );

        // A deadline from an earlier disconnect is ignored
        manager.handle_timer(TimerEvent::DisconnectExpired {
            peripheral: DEV.into(),
            id: 0,
        });
        assert_eq!(
            manager.registry.get(DEV).expect("known").state,
            ConnectionState::Disconnecting
        );

        manager.handle_timer(TimerEvent::DisconnectExpired {
            peripheral: DEV.into(),
            id: 1,
        });
        assert_eq!(
            manager.registry.get(DEV).expect("known").state,
            ConnectionState::Disconnected
        );
        assert!(manager.disconnecting.is_empty());
        assert_eq!(
            events.try_recv().expect("event"),
            CentralEvent::PeripheralDisconnected {
                peripheral: DEV.into(),
                error: None,
            }
        );
    }
}
