// bleman core - BLE central-role session manager
//
// Scans for, connects to and talks GATT with remote peripherals through a
// platform BLE stack that is injected as a capability. Every piece of session
// state lives inside one manager task; callers and the platform stack reach it
// only through channels.

pub mod central;
pub mod config;
pub mod gatt;
pub mod simulator;

use thiserror::Error;

pub use central::{
    event_channel, spawn_central, AdapterState, BlePlatform, CentralEvent, CentralHandle,
    EventSink, Notification, NotificationStream, PlatformEvent, PlatformEvents,
};
pub use config::{CentralConfig, ConfigError};
pub use gatt::{
    from_short, parse_uuid, short_uuid_string, Characteristic, CharacteristicProperties, CharacteristicRef,
    ConnectionState, Peripheral, PeripheralInfo, Service, ServiceTree, SubscriptionState,
    WriteType,
};
pub use simulator::{SimulatedPeripheral, SimulatedPlatform};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Busy: {0}")]
    Busy(String),
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Disconnected: {0}")]
    Disconnected(String),
    #[error("Platform error: {0}")]
    Platform(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Central manager not running")]
    NotRunning,
}

impl BleError {
    /// Whether the error was raised before any platform request was issued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BleError::NotFound(_)
                | BleError::InvalidState(_)
                | BleError::Busy(_)
                | BleError::CapabilityMismatch(_)
                | BleError::InvalidInput(_)
        )
    }
}

pub type Result<T, E = BleError> = std::result::Result<T, E>;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Safe to call more than once.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}
