//! Host alert registry.
//!
//! The store surfaces health problems as named alerts that an external
//! endpoint can poll. Alerts are idempotent: registering an active alert
//! refreshes its message, clearing an inactive one is a no-op.

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::warn;

/// Identifiers for the alerts the store can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertId {
    /// A disk I/O error occurred on a storage folder or the WAL.
    /// Auto-cleared by the next successful I/O on the same folder.
    HostDiskTrouble,
    /// An `add_sector` call found no folder with a free slot.
    HostOutOfStorage,
    /// A sector read failed Merkle-root verification.
    HostSectorCorruption,
}

/// A registered alert.
#[derive(Debug, Clone)]
pub struct Alert {
    /// Which condition the alert reports.
    pub id: AlertId,
    /// Human-readable description of the triggering event.
    pub message: String,
}

/// Registry of active alerts.
#[derive(Debug, Default)]
pub struct Alerter {
    active: Mutex<HashMap<AlertId, Alert>>,
}

impl Alerter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises or refreshes an alert.
    pub fn register(&self, id: AlertId, message: impl Into<String>) {
        let message = message.into();
        let mut active = self.active.lock();
        if !active.contains_key(&id) {
            warn!(?id, %message, "alert raised");
        }
        active.insert(id, Alert { id, message });
    }

    /// Clears an alert if it is active.
    pub fn clear(&self, id: AlertId) {
        if self.active.lock().remove(&id).is_some() {
            warn!(?id, "alert cleared");
        }
    }

    /// Returns true if the alert is currently active.
    pub fn is_active(&self, id: AlertId) -> bool {
        self.active.lock().contains_key(&id)
    }

    /// Snapshot of all active alerts.
    pub fn active(&self) -> Vec<Alert> {
        self.active.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_clear() {
        let alerter = Alerter::new();
        assert!(!alerter.is_active(AlertId::HostDiskTrouble));

        alerter.register(AlertId::HostDiskTrouble, "write failed");
        assert!(alerter.is_active(AlertId::HostDiskTrouble));
        assert_eq!(alerter.active().len(), 1);

        alerter.clear(AlertId::HostDiskTrouble);
        assert!(!alerter.is_active(AlertId::HostDiskTrouble));
    }

    #[test]
    fn clearing_inactive_alert_is_noop() {
        let alerter = Alerter::new();
        alerter.clear(AlertId::HostOutOfStorage);
        assert!(alerter.active().is_empty());
    }

    #[test]
    fn register_refreshes_message() {
        let alerter = Alerter::new();
        alerter.register(AlertId::HostSectorCorruption, "slot 3");
        alerter.register(AlertId::HostSectorCorruption, "slot 9");
        let active = alerter.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].message, "slot 9");
    }
}
