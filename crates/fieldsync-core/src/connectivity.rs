//! Connectivity monitoring seam.

use std::sync::{Arc, Mutex, PoisonError};

use crate::events::{Observers, Subscription};
use crate::models::ConnectivityStatus;

/// Read-only view of network and power state
pub trait ConnectivityMonitor: Send + Sync {
    fn current_status(&self) -> ConnectivityStatus;

    /// Register for status changes; the listener receives the new status.
    fn on_change(
        &self,
        listener: Box<dyn Fn(&ConnectivityStatus) + Send + Sync>,
    ) -> Subscription;
}

/// Monitor whose state is set by the host application (or a test)
#[derive(Clone)]
pub struct ManualConnectivity {
    status: Arc<Mutex<ConnectivityStatus>>,
    observers: Observers<ConnectivityStatus>,
}

impl ManualConnectivity {
    pub fn new(initial: ConnectivityStatus) -> Self {
        Self {
            status: Arc::new(Mutex::new(initial)),
            observers: Observers::new(),
        }
    }

    /// Replace the status; listeners hear about it only when it changed.
    pub fn set_status(&self, status: ConnectivityStatus) {
        let previous = {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, status)
        };
        if previous != status {
            if previous.is_online != status.is_online {
                tracing::info!(
                    "Connectivity changed: {}",
                    if status.is_online { "online" } else { "offline" }
                );
            }
            self.observers.emit(&status);
        }
    }

    pub fn set_online(&self, is_online: bool) {
        let current = self.current_status();
        let status = if is_online {
            ConnectivityStatus::online()
        } else {
            ConnectivityStatus {
                last_connected_at: current.last_connected_at,
                ..ConnectivityStatus::offline()
            }
        };
        self.set_status(ConnectivityStatus {
            battery_level: current.battery_level,
            is_charging: current.is_charging,
            ..status
        });
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(ConnectivityStatus::online())
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn current_status(&self) -> ConnectivityStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_change(
        &self,
        listener: Box<dyn Fn(&ConnectivityStatus) + Send + Sync>,
    ) -> Subscription {
        self.observers.subscribe(listener)
    }
}
