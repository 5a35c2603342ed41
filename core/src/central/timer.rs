//! Deadline scheduling for the manager task
//!
//! A scheduled deadline is a spawned sleep that posts a `TimerEvent` back into
//! the manager's own queue. Dropping the returned guard aborts the sleep, so a
//! deadline lives exactly as long as whatever owns the guard.

use super::pending::PendingKey;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Deadline notifications consumed by the manager loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// A pending operation's deadline passed
    OperationExpired { key: PendingKey, id: u64 },
    /// The in-flight acknowledged write of a peripheral did not complete in time
    WriteExpired { peripheral: String, dispatch: u64 },
    /// The auto-stop deadline of a scan session passed
    ScanExpired { session: u64 },
    /// The platform never confirmed a requested disconnect
    DisconnectExpired { peripheral: String, id: u64 },
    /// Next chunk of a paced unacknowledged write is due
    PacedWriteDue { peripheral: String, tick: u64 },
}

#[derive(Clone)]
pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<TimerEvent>,
}

impl Timers {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post `event` after `delay` unless the guard is dropped first
    pub(crate) fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerGuard {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!("Deadline reached: {:?}", event);
            let _ = tx.send(event);
        });
        TimerGuard { handle }
    }
}

/// Aborts the scheduled deadline on drop
#[derive(Debug)]
pub(crate) struct TimerGuard {
    handle: JoinHandle<()>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let (timers, mut rx) = Timers::new();
        let _guard = timers.schedule(Duration::from_millis(50), TimerEvent::ScanExpired { session: 7 });

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(rx.recv().await, Some(TimerEvent::ScanExpired { session: 7 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_cancels() {
        let (timers, mut rx) = Timers::new();
        let guard = timers.schedule(Duration::from_millis(50), TimerEvent::ScanExpired { session: 1 });
        drop(guard);

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
