//! Platform BLE stack capability
//!
//! The session manager never drives a radio itself. It issues primitive
//! requests through `BlePlatform` and receives the outcomes later as
//! `PlatformEvent`s pushed through an `EventSink`. Requests only report whether
//! they could be issued; results always arrive as events.

use crate::gatt::{CharacteristicRef, ServiceTree, WriteType};
use crate::BleError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Power / authorization state of the local adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Whether radio operations may be attempted
    pub fn is_usable(&self) -> bool {
        !matches!(
            self,
            AdapterState::Unsupported | AdapterState::Unauthorized | AdapterState::PoweredOff
        )
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "unknown"),
            AdapterState::Resetting => write!(f, "resetting"),
            AdapterState::Unsupported => write!(f, "unsupported"),
            AdapterState::Unauthorized => write!(f, "unauthorized"),
            AdapterState::PoweredOff => write!(f, "off"),
            AdapterState::PoweredOn => write!(f, "on"),
        }
    }
}

/// Primitive requests the core issues to the platform stack
#[cfg_attr(test, mockall::automock)]
pub trait BlePlatform: Send + Sync {
    fn start_scan(&self, service_filters: &[Uuid]) -> Result<(), BleError>;

    fn stop_scan(&self) -> Result<(), BleError>;

    fn connect(&self, peripheral: &str) -> Result<(), BleError>;

    fn disconnect(&self, peripheral: &str) -> Result<(), BleError>;

    fn discover_services(&self, peripheral: &str) -> Result<(), BleError>;

    fn read(&self, peripheral: &str, characteristic: &CharacteristicRef) -> Result<(), BleError>;

    fn write(
        &self,
        peripheral: &str,
        characteristic: &CharacteristicRef,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError>;

    fn set_notify(
        &self,
        peripheral: &str,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), BleError>;

    fn read_rssi(&self, peripheral: &str) -> Result<(), BleError>;
}

/// Asynchronous results and unsolicited events from the platform stack.
/// Failures carry the platform's native reason text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    AdapterStateChanged(AdapterState),
    PeripheralDiscovered {
        peripheral: String,
        name: Option<String>,
        rssi: Option<i16>,
        advertisement: Vec<u8>,
    },
    Connected {
        peripheral: String,
    },
    /// Link dropped or connect attempt failed; `error` is `None` for a clean
    /// disconnect
    Disconnected {
        peripheral: String,
        error: Option<String>,
    },
    ServicesDiscovered {
        peripheral: String,
        result: Result<ServiceTree, String>,
    },
    /// Read response (`for_read`) or notification/indication
    CharacteristicValueUpdated {
        peripheral: String,
        characteristic: CharacteristicRef,
        value: Result<Vec<u8>, String>,
        for_read: bool,
    },
    WriteConfirmed {
        peripheral: String,
        characteristic: CharacteristicRef,
        result: Result<(), String>,
    },
    NotifyStateChanged {
        peripheral: String,
        characteristic: CharacteristicRef,
        result: Result<bool, String>,
    },
    RssiRead {
        peripheral: String,
        result: Result<i16, String>,
    },
}

impl PlatformEvent {
    pub fn peripheral(&self) -> Option<&str> {
        match self {
            PlatformEvent::AdapterStateChanged(_) => None,
            PlatformEvent::PeripheralDiscovered { peripheral, .. }
            | PlatformEvent::Connected { peripheral }
            | PlatformEvent::Disconnected { peripheral, .. }
            | PlatformEvent::ServicesDiscovered { peripheral, .. }
            | PlatformEvent::CharacteristicValueUpdated { peripheral, .. }
            | PlatformEvent::WriteConfirmed { peripheral, .. }
            | PlatformEvent::NotifyStateChanged { peripheral, .. }
            | PlatformEvent::RssiRead { peripheral, .. } => Some(peripheral),
        }
    }
}

/// Platform-side end of the event channel. Cheap to clone and callable from
/// any thread without an async context.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

impl EventSink {
    /// Returns false once the manager has shut down
    pub fn send(&self, event: PlatformEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Manager-side end of the event channel
pub struct PlatformEvents {
    pub(crate) rx: mpsc::UnboundedReceiver<PlatformEvent>,
}

/// Create the channel a platform uses to push events into the manager
pub fn event_channel() -> (EventSink, PlatformEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, PlatformEvents { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_usability() {
        assert!(AdapterState::PoweredOn.is_usable());
        assert!(AdapterState::Unknown.is_usable());
        assert!(!AdapterState::PoweredOff.is_usable());
        assert!(!AdapterState::Unauthorized.is_usable());
    }

    #[test]
    fn test_sink_reports_closed_channel() {
        let (sink, events) = event_channel();
        assert!(sink.send(PlatformEvent::AdapterStateChanged(AdapterState::PoweredOn)));
        drop(events);
        assert!(!sink.send(PlatformEvent::Connected {
            peripheral: "dev1".into()
        }));
    }

    #[test]
    fn test_event_peripheral_accessor() {
        let event = PlatformEvent::RssiRead {
            peripheral: "dev1".into(),
            result: Ok(-60),
        };
        assert_eq!(event.peripheral(), Some("dev1"));
        assert_eq!(
            PlatformEvent::AdapterStateChanged(AdapterState::PoweredOff).peripheral(),
            None
        );
    }
}
