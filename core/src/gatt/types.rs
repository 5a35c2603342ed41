//! GATT data model for the central role
//!
//! A `Peripheral` owns its discovered `Service`s, which own their
//! `Characteristic`s. Everything else in the crate refers to them by id
//! (peripheral id string plus a `CharacteristicRef`) rather than by reference.

use super::uuids::short_uuid_string;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Connection lifecycle of a remote peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Seen in a scan (or known by id) but never connected
    Discovered,
    /// Connect requested, waiting for the platform
    Connecting,
    /// Link is up
    Connected,
    /// Disconnect requested, waiting for the platform
    Disconnecting,
    /// Link is down; the record is kept so a reconnect reuses it
    Disconnected,
}

impl ConnectionState {
    /// States from which a new connect may be issued
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Discovered | ConnectionState::Disconnected)
    }

    /// States in which the link is (or is about to be) held by the platform
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "discovered"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Notification subscription state of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Acknowledged or fire-and-forget characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteType::WithResponse => write!(f, "with-response"),
            WriteType::WithoutResponse => write!(f, "without-response"),
        }
    }
}

/// Capability flags advertised by a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn readable() -> Self {
        Self { read: true, ..Self::default() }
    }

    pub fn with_read(mut self) -> Self {
        self.read = true;
        self
    }

    pub fn with_write(mut self) -> Self {
        self.write = true;
        self
    }

    pub fn with_write_without_response(mut self) -> Self {
        self.write_without_response = true;
        self
    }

    pub fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }

    pub fn with_indicate(mut self) -> Self {
        self.indicate = true;
        self
    }

    /// Notifications and indications both deliver through a subscription
    pub fn is_notifiable(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn supports_write(&self, write_type: WriteType) -> bool {
        match write_type {
            WriteType::WithResponse => self.write,
            WriteType::WithoutResponse => self.write_without_response,
        }
    }
}

/// Address of a characteristic within one peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            short_uuid_string(&self.service),
            short_uuid_string(&self.characteristic)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    #[serde(default)]
    pub subscription: SubscriptionState,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            subscription: SubscriptionState::Unsubscribed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Builder-style helper used by platforms and tests
    pub fn with_characteristic(mut self, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        self.characteristics.push(Characteristic::new(uuid, properties));
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Result of one discovery cycle
pub type ServiceTree = Vec<Service>;

/// One remote BLE device as tracked by the registry
#[derive(Debug, Clone)]
pub struct Peripheral {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Raw advertisement payload from the last scan result
    pub advertisement: Vec<u8>,
    pub state: ConnectionState,
    pub services: Vec<Service>,
}

impl Peripheral {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
            advertisement: Vec::new(),
            state: ConnectionState::Discovered,
            services: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn services_known(&self) -> bool {
        !self.services.is_empty()
    }

    pub fn has_service(&self, uuid: &Uuid) -> bool {
        self.services.iter().any(|s| &s.uuid == uuid)
    }

    pub fn characteristic(&self, target: &CharacteristicRef) -> Option<&Characteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == target.service)
            .and_then(|s| s.characteristic(&target.characteristic))
    }

    pub fn characteristic_mut(&mut self, target: &CharacteristicRef) -> Option<&mut Characteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == target.service)
            .and_then(|s| {
                s.characteristics
                    .iter_mut()
                    .find(|c| c.uuid == target.characteristic)
            })
    }

    /// Merge a discovery result: services and characteristics are matched by
    /// UUID and replaced in place, new ones are appended. Subscription state of
    /// characteristics that survive the merge is preserved.
    pub fn merge_services(&mut self, discovered: ServiceTree) {
        for mut service in discovered {
            match self.services.iter_mut().find(|s| s.uuid == service.uuid) {
                Some(existing) => {
                    for characteristic in service.characteristics.iter_mut() {
                        if let Some(old) = existing.characteristic(&characteristic.uuid) {
                            characteristic.subscription = old.subscription;
                        }
                    }
                    *existing = service;
                }
                None => self.services.push(service),
            }
        }
    }

    /// Forget discovered services (after a disconnect)
    pub fn reset_discovery(&mut self) {
        self.services.clear();
    }

    pub fn snapshot(&self) -> PeripheralInfo {
        PeripheralInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            advertisement: hex::encode(&self.advertisement),
            state: self.state,
            services: self.services.clone(),
        }
    }
}

/// Caller-facing copy of a peripheral record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralInfo {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Hex-encoded advertisement payload
    pub advertisement: String,
    pub state: ConnectionState,
    pub services: Vec<Service>,
}
