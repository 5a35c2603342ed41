//! Scan controller
//!
//! One process-wide scan session. Starting a scan while one is active
//! replaces it: the old auto-stop deadline is disarmed, the platform scan is
//! re-issued with the new filters and the new deadline (if any) is armed.

use super::platform::BlePlatform;
use super::timer::{TimerEvent, TimerGuard, Timers};
use crate::BleError;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSession {
    pub id: u64,
    pub filters: Vec<Uuid>,
    pub deadline: Option<Instant>,
}

/// Outcome of `ScanController::start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanStart {
    Started,
    Replaced,
}

pub(crate) struct ScanController {
    session: Option<ScanSession>,
    auto_stop: Option<TimerGuard>,
    next_id: u64,
}

impl ScanController {
    pub(crate) fn new() -> Self {
        Self {
            session: None,
            auto_stop: None,
            next_id: 0,
        }
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn session(&self) -> Option<&ScanSession> {
        self.session.as_ref()
    }

    /// A zero timeout means "scan until stopped"
    pub(crate) fn start(
        &mut self,
        filters: Vec<Uuid>,
        timeout: Option<Duration>,
        platform: &dyn BlePlatform,
        timers: &Timers,
    ) -> Result<ScanStart, BleError> {
        let outcome = if self.is_scanning() {
            ScanStart::Replaced
        } else {
            ScanStart::Started
        };

        self.auto_stop = None;
        if let Err(e) = platform.start_scan(&filters) {
            self.session = None;
            return Err(e);
        }

        self.next_id += 1;
        let id = self.next_id;
        // A deadline too far out to represent is the same as none
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .and_then(|t| Instant::now().checked_add(t));
        let timeout = timeout.filter(|_| deadline.is_some());
        self.auto_stop = timeout.map(|t| timers.schedule(t, TimerEvent::ScanExpired { session: id }));

        info!(
            "Scan {} ({:?}, {} filters, timeout {:?})",
            id,
            outcome,
            filters.len(),
            timeout
        );
        self.session = Some(ScanSession {
            id,
            filters,
            deadline,
        });
        Ok(outcome)
    }

    /// Explicit stop. Returns whether a session was active; stopping an idle
    /// controller is a no-op.
    pub(crate) fn stop(&mut self, platform: &dyn BlePlatform) -> Result<bool, BleError> {
        self.auto_stop = None;
        match self.session.take() {
            Some(session) => {
                info!("Scan {} stopped", session.id);
                platform.stop_scan()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Auto-stop deadline; ignored unless it belongs to the current session
    pub(crate) fn on_expired(&mut self, session: u64, platform: &dyn BlePlatform) -> bool {
        if self.session.as_ref().map(|s| s.id) != Some(session) {
            debug!("Stale scan deadline {} ignored", session);
            return false;
        }
        if let Err(e) = self.stop(platform) {
            debug!("Platform stop_scan after auto-stop failed: {}", e);
        }
        true
    }

    /// Drop the session without talking to the platform (adapter went away)
    pub(crate) fn abandon(&mut self) -> bool {
        self.auto_stop = None;
        self.session.take().is_some()
    }
}
