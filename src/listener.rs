use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;

use crate::device::Device;

/// Identity of the gateway a notification comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubInfo {
    pub hub_id: String,
    pub address: String,
}

/// Returned by a listener that could not handle a notification.
#[derive(Debug, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

pub type ListenerResult = std::result::Result<(), ListenerError>;

/// Receives device and connection events from a gateway client.
///
/// A listener that returns an error (or panics) from one of the device
/// callbacks is unregistered. Discovery failures are only logged.
pub trait DeviceStatusListener: Send + Sync {
    fn on_device_changed(&self, _hub_id: &str, _device: &Device) -> ListenerResult {
        Ok(())
    }
    fn on_device_discovered(&self, _hub: &HubInfo, _device: &Device) -> ListenerResult {
        Ok(())
    }
    fn on_device_removed(&self, _hub: &HubInfo, _device: &Device) -> ListenerResult {
        Ok(())
    }
    fn on_device_config_updated(&self, _hub: &HubInfo, _device: &Device) -> ListenerResult {
        Ok(())
    }
    /// The gateway answered again after a connection loss.
    fn on_connection(&self, _hub: &HubInfo) {}
    /// The gateway stopped answering; cached device state is stale.
    fn on_connection_lost(&self, _hub: &HubInfo) {}
}

/// What happened to a failing listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    Unregister,
    Log,
}

/// Outcome of one notification round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub unregistered: usize,
}

type Listeners = Arc<Vec<Arc<dyn DeviceStatusListener>>>;

fn same_listener(a: &Arc<dyn DeviceStatusListener>, b: &Arc<dyn DeviceStatusListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Copy-on-write listener set: notification iterates over a snapshot, so
/// listeners may (un)register from any task, even from inside a callback.
///
/// The set also remembers which devices its listeners have been told
/// about. Any unregistration, explicit or after a failed callback, forgets
/// them all so the next refresh announces every device as discovered.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Listeners>,
    reported: Mutex<HashSet<String>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn reported(&self) -> MutexGuard<'_, HashSet<String>> {
        self.reported.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Listeners {
        Arc::clone(&self.listeners.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns false if the listener was already registered.
    pub fn register(&self, listener: Arc<dyn DeviceStatusListener>) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if guard.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Returns false if the listener was not registered.
    pub fn unregister(&self, listener: &Arc<dyn DeviceStatusListener>) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|l| same_listener(l, listener)) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !same_listener(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        drop(guard);
        self.forget_all_reported();
        true
    }

    /// Whether `serial` was announced since the last reset.
    pub fn was_reported(&self, serial: &str) -> bool {
        self.reported().contains(serial)
    }

    pub fn mark_reported(&self, serial: &str) {
        self.reported().insert(serial.to_string());
    }

    pub fn forget_reported(&self, serial: &str) {
        self.reported().remove(serial);
    }

    pub fn forget_all_reported(&self) {
        self.reported().clear();
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Calls `f` for every registered listener, isolating failures.
    pub fn notify<F>(&self, event: &'static str, on_failure: OnFailure, f: F) -> Delivery
    where
        F: Fn(&dyn DeviceStatusListener) -> ListenerResult,
    {
        let mut delivery = Delivery::default();
        for listener in self.snapshot().iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(listener.as_ref())));
            let failure = match outcome {
                Ok(Ok(())) => {
                    delivery.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "listener panicked".to_string(),
            };
            tracing::error!(event, error = %failure, "An exception occurred while calling a device status listener");
            if on_failure == OnFailure::Unregister && self.unregister(listener) {
                delivery.unregistered += 1;
            }
        }
        delivery
    }

    /// Delivers an infallible event (connection state) to every listener.
    pub fn broadcast(&self, event: &'static str, f: impl Fn(&dyn DeviceStatusListener)) {
        self.notify(event, OnFailure::Log, |l| {
            f(l);
            Ok(())
        });
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .field("reported", &self.reported().len())
            .finish()
    }
}
