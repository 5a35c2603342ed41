//! Pending-operation tables
//!
//! Platform callbacks are keyed by device and characteristic, never by
//! request, so every awaited operation is parked here under a
//! `(peripheral, kind, characteristic)` key until the matching event (or its
//! deadline) arrives. A key holds at most one waiter.

use super::timer::{TimerEvent, TimerGuard, Timers};
use crate::gatt::CharacteristicRef;
use crate::BleError;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Caller continuation for an awaited operation
pub(crate) type Reply<T> = oneshot::Sender<Result<T, BleError>>;

/// Operation kinds that wait for a platform event.
/// Acknowledged writes are tracked by the write queue instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    DiscoverServices,
    Read,
    ReadRssi,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Connect => write!(f, "connect"),
            OperationKind::DiscoverServices => write!(f, "discover-services"),
            OperationKind::Read => write!(f, "read"),
            OperationKind::ReadRssi => write!(f, "read-rssi"),
            OperationKind::Subscribe => write!(f, "subscribe"),
            OperationKind::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub peripheral: String,
    pub kind: OperationKind,
    pub characteristic: Option<CharacteristicRef>,
}

impl PendingKey {
    pub fn peripheral(peripheral: &str, kind: OperationKind) -> Self {
        Self {
            peripheral: peripheral.to_string(),
            kind,
            characteristic: None,
        }
    }

    pub fn characteristic(
        peripheral: &str,
        kind: OperationKind,
        characteristic: CharacteristicRef,
    ) -> Self {
        Self {
            peripheral: peripheral.to_string(),
            kind,
            characteristic: Some(characteristic),
        }
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.characteristic {
            Some(characteristic) => {
                write!(f, "{} {} {}", self.kind, self.peripheral, characteristic)
            }
            None => write!(f, "{} {}", self.kind, self.peripheral),
        }
    }
}

struct PendingEntry<T> {
    id: u64,
    reply: Reply<T>,
    _deadline: TimerGuard,
}

/// One table per operation kind; `T` is the success value handed to the caller
pub(crate) struct PendingTable<T> {
    kind: OperationKind,
    entries: HashMap<PendingKey, PendingEntry<T>>,
    next_id: u64,
}

impl<T> PendingTable<T> {
    pub(crate) fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn contains(&self, key: &PendingKey) -> bool {
        self.entries.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Busy check, run during validation before any platform request
    pub(crate) fn ensure_idle(&self, key: &PendingKey) -> Result<(), BleError> {
        if self.contains(key) {
            return Err(BleError::Busy(format!("{} already in progress", key)));
        }
        Ok(())
    }

    /// Park `reply` under `key` with a deadline. A key that is already taken is
    /// never overwritten: the new caller gets `Busy` and `None` is returned.
    pub(crate) fn register(
        &mut self,
        key: PendingKey,
        reply: Reply<T>,
        timeout: Duration,
        timers: &Timers,
    ) -> Option<u64> {
        debug_assert_eq!(key.kind, self.kind);
        if let Err(busy) = self.ensure_idle(&key) {
            let _ = reply.send(Err(busy));
            return None;
        }

        self.next_id += 1;
        let id = self.next_id;
        let deadline = timers.schedule(
            timeout,
            TimerEvent::OperationExpired {
                key: key.clone(),
                id,
            },
        );
        debug!("Pending {} (#{}, {:?})", key, id, timeout);
        self.entries.insert(
            key,
            PendingEntry {
                id,
                reply,
                _deadline: deadline,
            },
        );
        Some(id)
    }

    /// Deliver `result` to the waiter under `key`. Returns false when nothing
    /// was pending (late or unsolicited platform event).
    pub(crate) fn resolve(&mut self, key: &PendingKey, result: Result<T, BleError>) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                if entry.reply.send(result).is_err() {
                    debug!("Caller for {} went away before the result arrived", key);
                }
                true
            }
            None => {
                debug!("No pending {}; dropping platform result", key);
                false
            }
        }
    }

    /// Deadline handler. Only the registration identified by `id` is expired,
    /// so a stale deadline cannot fail a newer request reusing the key.
    pub(crate) fn expire(&mut self, key: &PendingKey, id: u64) -> bool {
        let current = self.entries.get(key).map_or(false, |entry| entry.id == id);
        if !current {
            return false;
        }
        if let Some(entry) = self.entries.remove(key) {
            let _ = entry
                .reply
                .send(Err(BleError::Timeout(format!("{} got no response", key))));
        }
        true
    }

    /// Fail every waiter belonging to `peripheral`; returns how many were failed
    pub(crate) fn fail_peripheral(&mut self, peripheral: &str, error: &BleError) -> usize {
        let keys: Vec<PendingKey> = self
            .entries
            .keys()
            .filter(|k| k.peripheral == peripheral)
            .cloned()
            .collect();
        for key in &keys {
            self.resolve(key, Err(error.clone()));
        }
        keys.len()
    }

    pub(crate) fn fail_all(&mut self, error: &BleError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.reply.send(Err(error.clone()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::from_short;
    use tokio::sync::oneshot;

    fn read_key(peripheral: &str) -> PendingKey {
        PendingKey::characteristic(
            peripheral,
            OperationKind::Read,
            CharacteristicRef::new(from_short(0x180D), from_short(0x2A38)),
        )
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let (timers, _rx) = Timers::new();
        let mut table: PendingTable<Vec<u8>> = PendingTable::new(OperationKind::Read);
        let (tx, rx) = oneshot::channel();

        table
            .register(read_key("dev1"), tx, Duration::from_secs(5), &timers)
            .expect("registered");
        assert!(table.resolve(&read_key("dev1"), Ok(vec![1, 2])));

        assert_eq!(rx.await.expect("reply"), Ok(vec![1, 2]));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_second_request_is_busy() {
        let (timers, _rx) = Timers::new();
        let mut table: PendingTable<Vec<u8>> = PendingTable::new(OperationKind::Read);
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();

        table.register(read_key("dev1"), first_tx, Duration::from_secs(5), &timers);
        assert!(table
            .register(read_key("dev1"), second_tx, Duration::from_secs(5), &timers)
            .is_none());

        assert!(matches!(second_rx.await.expect("reply"), Err(BleError::Busy(_))));

        // The original waiter still owns the key
        table.resolve(&read_key("dev1"), Ok(vec![9]));
        assert_eq!(first_rx.await.expect("reply"), Ok(vec![9]));
    }

    #[tokio::test]
    async fn test_resolve_without_pending_is_ignored() {
        let mut table: PendingTable<()> = PendingTable::new(OperationKind::Read);
        assert!(!table.resolve(&read_key("dev1"), Ok(())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_delivers_timeout_once() {
        let (timers, mut timer_rx) = Timers::new();
        let mut table: PendingTable<Vec<u8>> = PendingTable::new(OperationKind::Read);
        let (tx, rx) = oneshot::channel();
        table.register(read_key("dev1"), tx, Duration::from_millis(100), &timers);

        let Some(TimerEvent::OperationExpired { key, id }) = timer_rx.recv().await else {
            panic!("expected an expiry event");
        };
        assert!(table.expire(&key, id));
        assert!(matches!(rx.await.expect("reply"), Err(BleError::Timeout(_))));

        // Late platform result and repeated expiry are both no-ops
        assert!(!table.resolve(&key, Ok(vec![1])));
        assert!(!table.expire(&key, id));
    }

    #[tokio::test]
    async fn test_stale_expiry_does_not_hit_new_request() {
        let (timers, _rx) = Timers::new();
        let mut table: PendingTable<Vec<u8>> = PendingTable::new(OperationKind::Read);

        let (tx, _first) = oneshot::channel();
        let old_id = table
            .register(read_key("dev1"), tx, Duration::from_secs(5), &timers)
            .expect("registered");
        table.resolve(&read_key("dev1"), Ok(vec![]));

        let (tx, rx) = oneshot::channel();
        table.register(read_key("dev1"), tx, Duration::from_secs(5), &timers);

        assert!(!table.expire(&read_key("dev1"), old_id));
        assert!(table.contains(&read_key("dev1")));
        drop(table);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_fail_peripheral_only_touches_that_device() {
        let (timers, _rx) = Timers::new();
        let mut table: PendingTable<Vec<u8>> = PendingTable::new(OperationKind::Read);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        table.register(read_key("dev1"), tx1, Duration::from_secs(5), &timers);
        table.register(read_key("dev2"), tx2, Duration::from_secs(5), &timers);

        let failed = table.fail_peripheral("dev1", &BleError::Disconnected("dev1".into()));
        assert_eq!(failed, 1);
        assert!(matches!(rx1.await.expect("reply"), Err(BleError::Disconnected(_))));
        assert!(table.contains(&read_key("dev2")));
    }
}
