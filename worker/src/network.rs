//! Network condition gating.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports current connectivity.
pub trait NetworkConditions: Send + Sync {
    fn is_wifi_connected(&self) -> bool;
    fn is_cellular_connected(&self) -> bool;
}

/// Whether uploads may proceed under the given conditions.
///
/// Wifi always qualifies; cellular only when `allow_cellular` is set.
pub fn uploads_permitted(network: &dyn NetworkConditions, allow_cellular: bool) -> bool {
    network.is_wifi_connected() || (allow_cellular && network.is_cellular_connected())
}

/// Connectivity that only changes when told to.
#[derive(Debug)]
pub struct StaticNetwork {
    wifi: AtomicBool,
    cellular: AtomicBool,
}

impl StaticNetwork {
    pub fn new(wifi: bool, cellular: bool) -> Self {
        Self {
            wifi: AtomicBool::new(wifi),
            cellular: AtomicBool::new(cellular),
        }
    }

    pub fn wifi() -> Self {
        Self::new(true, false)
    }

    pub fn cellular() -> Self {
        Self::new(false, true)
    }

    pub fn offline() -> Self {
        Self::new(false, false)
    }

    pub fn set_wifi(&self, connected: bool) {
        self.wifi.store(connected, Ordering::SeqCst);
    }

    pub fn set_cellular(&self, connected: bool) {
        self.cellular.store(connected, Ordering::SeqCst);
    }
}

impl Default for StaticNetwork {
    fn default() -> Self {
        Self::wifi()
    }
}

impl NetworkConditions for StaticNetwork {
    fn is_wifi_connected(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }

    fn is_cellular_connected(&self) -> bool {
        self.cellular.load(Ordering::SeqCst)
    }
}
