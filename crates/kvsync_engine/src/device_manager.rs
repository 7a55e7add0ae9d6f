//! Tracks which remote devices are reachable.

use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Online device set fed by communicator presence events.
#[derive(Debug, Default)]
pub struct DeviceManager {
    online: RwLock<BTreeSet<String>>,
}

impl DeviceManager {
    /// Creates an empty device set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a presence change. Returns true if the state changed.
    pub fn on_presence(&self, device: &str, online: bool) -> bool {
        let mut devices = self.online.write();
        if online {
            devices.insert(device.to_string())
        } else {
            devices.remove(device)
        }
    }

    /// Returns true if `device` is known to be online.
    pub fn is_online(&self, device: &str) -> bool {
        self.online.read().contains(device)
    }

    /// Online devices, sorted.
    pub fn online_devices(&self) -> Vec<String> {
        self.online.read().iter().cloned().collect()
    }

    /// Forgets every device.
    pub fn clear(&self) {
        self.online.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_changes_are_reported_once() {
        let devices = DeviceManager::new();
        assert!(devices.on_presence("b", true));
        assert!(!devices.on_presence("b", true));
        assert!(devices.on_presence("a", true));
        assert_eq!(devices.online_devices(), vec!["a", "b"]);

        assert!(devices.on_presence("b", false));
        assert!(!devices.on_presence("b", false));
        assert!(!devices.is_online("b"));
        assert!(devices.is_online("a"));
    }
}
