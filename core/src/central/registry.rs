//! Peripheral registry
//!
//! Single source of truth for every known peripheral and its connection
//! state. Records are keyed by the platform id; iteration follows discovery
//! order.

use crate::gatt::{ConnectionState, Peripheral, Service, ServiceTree};
use crate::BleError;
use std::collections::HashMap;

#[derive(Default)]
pub struct PeripheralRegistry {
    peripherals: HashMap<String, Peripheral>,
    order: Vec<String>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-or-fetch
    pub fn upsert(&mut self, id: &str) -> &mut Peripheral {
        if !self.peripherals.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.peripherals
            .entry(id.to_string())
            .or_insert_with(|| Peripheral::new(id))
    }

    pub fn get(&self, id: &str) -> Result<&Peripheral, BleError> {
        self.peripherals
            .get(id)
            .ok_or_else(|| BleError::NotFound(format!("peripheral {}", id)))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Peripheral, BleError> {
        self.peripherals
            .get_mut(id)
            .ok_or_else(|| BleError::NotFound(format!("peripheral {}", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peripherals.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Peripheral> {
        let removed = self.peripherals.remove(id)?;
        self.order.retain(|known| known != id);
        Some(removed)
    }

    /// Returns the previous state
    pub fn set_connection_state(
        &mut self,
        id: &str,
        state: ConnectionState,
    ) -> Result<ConnectionState, BleError> {
        let peripheral = self.get_mut(id)?;
        let previous = peripheral.state;
        peripheral.state = state;
        Ok(previous)
    }

    /// Merge one discovery result and return the full service list
    pub fn record_services(&mut self, id: &str, services: ServiceTree) -> Result<&[Service], BleError> {
        let peripheral = self.get_mut(id)?;
        peripheral.merge_services(services);
        Ok(&peripheral.services)
    }

    /// Keep only the peripherals matching `keep`; returns the removed ids
    pub fn retain(&mut self, mut keep: impl FnMut(&Peripheral) -> bool) -> Vec<String> {
        let removed: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.peripherals.get(id.as_str()).map_or(false, |p| !keep(p)))
            .cloned()
            .collect();
        for id in &removed {
            self.remove(id);
        }
        removed
    }

    /// Peripherals in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &Peripheral> {
        self.order.iter().filter_map(|id| self.peripherals.get(id))
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{from_short, CharacteristicProperties};

    #[test]
    fn test_upsert_is_idempotent() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert("AA:BB:CC:DD:EE:FF").rssi = Some(-70);
        registry.upsert("AA:BB:CC:DD:EE:FF").rssi = Some(-55);

        assert_eq!(registry.len(), 1);
        let peripheral = registry.get("AA:BB:CC:DD:EE:FF").expect("known");
        assert_eq!(peripheral.rssi, Some(-55));
        assert_eq!(peripheral.state, ConnectionState::Discovered);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = PeripheralRegistry::new();
        assert!(matches!(registry.get("nope"), Err(BleError::NotFound(_))));
    }

    #[test]
    fn test_iteration_follows_discovery_order() {
        let mut registry = PeripheralRegistry::new();
        for id in ["c", "a", "b", "a"] {
            registry.upsert(id);
        }
        let ids: Vec<&str> = registry.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_set_state_returns_previous() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert("dev1");
        let previous = registry
            .set_connection_state("dev1", ConnectionState::Connecting)
            .expect("known");
        assert_eq!(previous, ConnectionState::Discovered);
        assert!(registry
            .set_connection_state("dev2", ConnectionState::Connecting)
            .is_err());
    }

    #[test]
    fn test_record_services_is_additive() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert("dev1");
        let battery = Service::new(from_short(0x180F))
            .with_characteristic(from_short(0x2A19), CharacteristicProperties::readable());

        registry
            .record_services("dev1", vec![battery.clone()])
            .expect("known");
        let services = registry
            .record_services("dev1", vec![battery, Service::new(from_short(0x180A))])
            .expect("known");
        assert_eq!(services.len(), 2);
    }

    #[test]
    fn test_retain_drops_unlinked() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert("idle");
        registry.upsert("linked").state = ConnectionState::Connected;

        let removed = registry.retain(|p| p.state.is_linked());
        assert_eq!(removed, vec!["idle".to_string()]);
        assert!(registry.contains("linked"));
        assert!(!registry.contains("idle"));
    }
}
