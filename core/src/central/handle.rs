//! Caller-facing handle to the central manager task
//!
//! `CentralHandle` is cheap to clone; every method sends a `Command` with a
//! one-shot reply channel and awaits the answer. Identifier parsing and
//! payload checks happen here, before anything is queued.

use super::events::{CentralEvent, NotificationStream};
use super::manager::CentralManager;
use super::pending::Reply;
use super::platform::{AdapterState, BlePlatform, PlatformEvents};
use super::timer::Timers;
use crate::config::CentralConfig;
use crate::gatt::{parse_uuid, CharacteristicRef, PeripheralInfo, ServiceTree, WriteType};
use crate::BleError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

/// Commands consumed by the manager loop
pub(crate) enum Command {
    StartScan {
        filters: Vec<Uuid>,
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    StopScan {
        reply: Reply<()>,
    },
    IsScanning {
        reply: Reply<bool>,
    },
    Connect {
        peripheral: String,
        /// `None` uses the configured connect timeout
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    Disconnect {
        peripheral: String,
        reply: Reply<()>,
    },
    DiscoverServices {
        peripheral: String,
        reply: Reply<ServiceTree>,
    },
    Read {
        peripheral: String,
        characteristic: CharacteristicRef,
        reply: Reply<Vec<u8>>,
    },
    Write {
        peripheral: String,
        characteristic: CharacteristicRef,
        data: Vec<u8>,
        write_type: WriteType,
        reply: Reply<()>,
    },
    ReadRssi {
        peripheral: String,
        reply: Reply<i16>,
    },
    Subscribe {
        peripheral: String,
        characteristic: CharacteristicRef,
        reply: Reply<NotificationStream>,
    },
    Unsubscribe {
        peripheral: String,
        characteristic: CharacteristicRef,
        reply: Reply<()>,
    },
    GetPeripheral {
        peripheral: String,
        reply: Reply<PeripheralInfo>,
    },
    DiscoveredPeripherals {
        reply: Reply<Vec<PeripheralInfo>>,
    },
    ConnectedPeripherals {
        services: Vec<Uuid>,
        reply: Reply<Vec<PeripheralInfo>>,
    },
    RemovePeripheral {
        peripheral: String,
        reply: Reply<()>,
    },
    AdapterState {
        reply: Reply<AdapterState>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Start the manager task on the current tokio runtime.
///
/// `events` is the receiving half of `event_channel()`; the platform keeps the
/// matching `EventSink`.
pub fn spawn_central(
    platform: Arc<dyn BlePlatform>,
    events: PlatformEvents,
    config: CentralConfig,
) -> Result<CentralHandle, BleError> {
    config
        .validate()
        .map_err(|e| BleError::InvalidInput(e.to_string()))?;

    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (event_tx, _) = broadcast::channel(config.event_buffer);
    let (timers, timer_rx) = Timers::new();

    let manager = CentralManager::new(platform, config, timers, event_tx.clone());
    tokio::spawn(manager.run(command_rx, events, timer_rx));

    Ok(CentralHandle {
        command_tx,
        event_tx,
    })
}

/// Handle for issuing commands to the central manager
#[derive(Clone)]
pub struct CentralHandle {
    command_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<CentralEvent>,
}

impl CentralHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, BleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| BleError::NotRunning)?;
        reply_rx.await.map_err(|_| BleError::NotRunning)?
    }

    fn characteristic(service: &str, characteristic: &str) -> Result<CharacteristicRef, BleError> {
        Ok(CharacteristicRef::new(
            parse_uuid(service)?,
            parse_uuid(characteristic)?,
        ))
    }

    /// Subscribe to application events (discoveries, link changes, scan stop)
    pub fn events(&self) -> broadcast::Receiver<CentralEvent> {
        self.event_tx.subscribe()
    }

    /// Start (or replace) the scan session. A zero or absent timeout scans
    /// until `stop_scan`.
    pub async fn start_scan(
        &self,
        service_filters: Vec<Uuid>,
        timeout: Option<Duration>,
    ) -> Result<(), BleError> {
        self.request(|reply| Command::StartScan {
            filters: service_filters,
            timeout,
            reply,
        })
        .await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.request(|reply| Command::StopScan { reply }).await
    }

    pub async fn is_scanning(&self) -> Result<bool, BleError> {
        self.request(|reply| Command::IsScanning { reply }).await
    }

    /// Connect to a known peripheral. `None` uses the configured timeout.
    pub async fn connect(&self, peripheral: &str, timeout: Option<Duration>) -> Result<(), BleError> {
        self.request(|reply| Command::Connect {
            peripheral: peripheral.to_string(),
            timeout,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self, peripheral: &str) -> Result<(), BleError> {
        self.request(|reply| Command::Disconnect {
            peripheral: peripheral.to_string(),
            reply,
        })
        .await
    }

    /// Run service discovery and return every service known so far
    pub async fn discover_services(&self, peripheral: &str) -> Result<ServiceTree, BleError> {
        self.request(|reply| Command::DiscoverServices {
            peripheral: peripheral.to_string(),
            reply,
        })
        .await
    }

    pub async fn read(
        &self,
        peripheral: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, BleError> {
        let characteristic = Self::characteristic(service, characteristic)?;
        self.request(|reply| Command::Read {
            peripheral: peripheral.to_string(),
            characteristic,
            reply,
        })
        .await
    }

    /// Acknowledged writes resolve once the platform confirms them (in
    /// submission order); unacknowledged writes resolve once handed over.
    pub async fn write(
        &self,
        peripheral: &str,
        service: &str,
        characteristic: &str,
        data: Vec<u8>,
        write_type: WriteType,
    ) -> Result<(), BleError> {
        let characteristic = Self::characteristic(service, characteristic)?;
        if data.is_empty() {
            return Err(BleError::InvalidInput("empty write payload".to_string()));
        }
        self.request(|reply| Command::Write {
            peripheral: peripheral.to_string(),
            characteristic,
            data,
            write_type,
            reply,
        })
        .await
    }

    pub async fn read_rssi(&self, peripheral: &str) -> Result<i16, BleError> {
        self.request(|reply| Command::ReadRssi {
            peripheral: peripheral.to_string(),
            reply,
        })
        .await
    }

    /// Enable notifications; values arrive on the returned stream
    pub async fn subscribe(
        &self,
        peripheral: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<NotificationStream, BleError> {
        let characteristic = Self::characteristic(service, characteristic)?;
        self.request(|reply| Command::Subscribe {
            peripheral: peripheral.to_string(),
            characteristic,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        peripheral: &str,
        service: &str,
        characteristic: &str,
    ) -> Result<(), BleError> {
        let characteristic = Self::characteristic(service, characteristic)?;
        self.request(|reply| Command::Unsubscribe {
            peripheral: peripheral.to_string(),
            characteristic,
            reply,
        })
        .await
    }

    pub async fn peripheral(&self, peripheral: &str) -> Result<PeripheralInfo, BleError> {
        self.request(|reply| Command::GetPeripheral {
            peripheral: peripheral.to_string(),
            reply,
        })
        .await
    }

    /// Every known peripheral, in discovery order
    pub async fn discovered_peripherals(&self) -> Result<Vec<PeripheralInfo>, BleError> {
        self.request(|reply| Command::DiscoveredPeripherals { reply })
            .await
    }

    /// Connected peripherals exposing at least one of `services` (all of
    /// them when `services` is empty)
    pub async fn connected_peripherals(
        &self,
        services: &[Uuid],
    ) -> Result<Vec<PeripheralInfo>, BleError> {
        self.request(|reply| Command::ConnectedPeripherals {
            services: services.to_vec(),
            reply,
        })
        .await
    }

    /// Forget a peripheral that is not linked
    pub async fn remove_peripheral(&self, peripheral: &str) -> Result<(), BleError> {
        self.request(|reply| Command::RemovePeripheral {
            peripheral: peripheral.to_string(),
            reply,
        })
        .await
    }

    /// Last reported adapter state; also re-broadcast as an event
    pub async fn adapter_state(&self) -> Result<AdapterState, BleError> {
        self.request(|reply| Command::AdapterState { reply }).await
    }

    /// Stop the manager task; outstanding operations fail with `NotRunning`
    pub async fn shutdown(&self) -> Result<(), BleError> {
        info!("Central manager shutdown requested");
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
