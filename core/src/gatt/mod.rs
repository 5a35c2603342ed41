//! GATT data model
//!
//! Peripherals, services and characteristics as the session manager tracks
//! them, plus helpers for the short (16/32-bit) UUID forms used by most
//! callers.

pub mod types;
pub mod uuids;

pub use types::{
    Characteristic, CharacteristicProperties, CharacteristicRef, ConnectionState, Peripheral,
    PeripheralInfo, Service, ServiceTree, SubscriptionState, WriteType,
};
pub use uuids::{from_short, parse_uuid, short_uuid_string, BLUETOOTH_BASE_UUID};
