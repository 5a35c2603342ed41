//! BLE central-role session manager
//!
//! One manager task per adapter. It is started with `spawn_central` and driven
//! through a `CentralHandle`; the platform BLE stack is injected as a
//! `BlePlatform` and reports back through an `EventSink`.

mod events;
mod handle;
mod manager;
mod pending;
mod platform;
pub mod registry;
mod scan;
mod timer;
mod write_queue;

pub use events::{CentralEvent, Notification, NotificationStream};
pub use handle::{spawn_central, CentralHandle};
pub use pending::{OperationKind, PendingKey};
pub use platform::{
    event_channel, AdapterState, BlePlatform, EventSink, PlatformEvent, PlatformEvents,
};
pub use registry::PeripheralRegistry;
pub use scan::ScanSession;
