//! Caller-facing events and notification streams

use super::platform::AdapterState;
use crate::gatt::{CharacteristicRef, PeripheralInfo};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Application-level events broadcast by the central manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CentralEvent {
    AdapterStateChanged(AdapterState),
    /// A scan result created or refreshed a registry entry
    PeripheralDiscovered(PeripheralInfo),
    PeripheralConnected {
        peripheral: String,
    },
    /// Link went down; `error` carries the platform reason for unexpected drops
    PeripheralDisconnected {
        peripheral: String,
        error: Option<String>,
    },
    /// The scan session ended, explicitly, by deadline or because the adapter
    /// went away
    ScanStopped,
}

impl fmt::Display for CentralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentralEvent::AdapterStateChanged(state) => write!(f, "AdapterStateChanged({})", state),
            CentralEvent::PeripheralDiscovered(info) => write!(
                f,
                "PeripheralDiscovered {{ id: {}, name: {:?}, rssi: {:?} }}",
                info.id, info.name, info.rssi
            ),
            CentralEvent::PeripheralConnected { peripheral } => {
                write!(f, "PeripheralConnected {{ id: {} }}", peripheral)
            }
            CentralEvent::PeripheralDisconnected { peripheral, error } => write!(
                f,
                "PeripheralDisconnected {{ id: {}, error: {:?} }}",
                peripheral, error
            ),
            CentralEvent::ScanStopped => write!(f, "ScanStopped"),
        }
    }
}

/// One value pushed by a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub peripheral: String,
    pub characteristic: CharacteristicRef,
    pub value: Vec<u8>,
}

/// Ongoing stream of notifications for one subscription.
///
/// Ends (yields `None`) once the subscription is acknowledged as removed, the
/// peripheral disconnects or is forgotten, or the manager shuts down.
#[derive(Debug)]
pub struct NotificationStream {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Non-blocking poll; `None` when nothing is buffered right now
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

impl Stream for NotificationStream {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::from_short;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_yields_in_order_then_ends() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = NotificationStream::new(rx);
        let characteristic = CharacteristicRef::new(from_short(0x180D), from_short(0x2A37));

        for value in [1u8, 2, 3] {
            tx.send(Notification {
                peripheral: "dev1".into(),
                characteristic,
                value: vec![value],
            })
            .expect("open");
        }
        drop(tx);

        let values: Vec<Vec<u8>> = stream.by_ref().map(|n| n.value).collect().await;
        assert_eq!(values, vec![vec![1], vec![2], vec![3]]);
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn test_stream_pending_until_notified() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = tokio_test::task::spawn(NotificationStream::new(rx));

        tokio_test::assert_pending!(stream.poll_next());
        tx.send(Notification {
            peripheral: "dev1".into(),
            characteristic: CharacteristicRef::new(from_short(0x180F), from_short(0x2A19)),
            value: vec![42],
        })
        .expect("open");
        assert!(stream.is_woken());
        match stream.poll_next() {
            Poll::Ready(Some(notification)) => assert_eq!(notification.value, vec![42]),
            other => panic!("unexpected poll result: {:?}", other),
        }
    }

    #[test]
    fn test_event_display() {
        let event = CentralEvent::PeripheralDisconnected {
            peripheral: "dev1".into(),
            error: None,
        };
        assert_eq!(event.to_string(), "PeripheralDisconnected { id: dev1, error: None }");
    }
}
