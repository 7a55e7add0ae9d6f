//! Permission gate in front of every data exchange.

use crate::storage::StoreInfo;
use kvsync_protocol::SyncMode;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Direction being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckFlag {
    /// Local data flows to the remote device.
    Send,
    /// Remote data flows into the local store.
    Receive,
    /// Both directions.
    Both,
}

impl CheckFlag {
    /// Direction implied by a mode run on the local side.
    pub fn for_mode(mode: SyncMode) -> Self {
        match (mode.sends_data(), mode.receives_data()) {
            (true, true) => CheckFlag::Both,
            (false, true) => CheckFlag::Receive,
            _ => CheckFlag::Send,
        }
    }

    /// Direction implied on the local side when a peer runs `mode` against us.
    pub fn for_remote_mode(mode: SyncMode) -> Self {
        match CheckFlag::for_mode(mode) {
            CheckFlag::Send => CheckFlag::Receive,
            CheckFlag::Receive => CheckFlag::Send,
            CheckFlag::Both => CheckFlag::Both,
        }
    }

    /// Returns true if `self` authorizes everything `other` needs.
    pub fn covers(&self, other: CheckFlag) -> bool {
        *self == CheckFlag::Both || *self == other
    }
}

/// Pluggable authorization provider.
pub trait PermissionChecker: Send + Sync {
    /// Returns true if `device` may exchange data with `store` in `flag`
    /// direction.
    fn check(&self, store: &StoreInfo, device: &str, flag: CheckFlag) -> bool;
}

/// Authorizes everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn check(&self, _store: &StoreInfo, _device: &str, _flag: CheckFlag) -> bool {
        true
    }
}

/// Refuses configured directions per device and allows the rest.
#[derive(Debug, Default)]
pub struct DeviceDenyList {
    denied: RwLock<HashMap<String, CheckFlag>>,
}

impl DeviceDenyList {
    /// Creates an empty deny list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses `flag` for `device`.
    pub fn deny(&self, device: impl Into<String>, flag: CheckFlag) {
        self.denied.write().insert(device.into(), flag);
    }

    /// Clears any denial for `device`.
    pub fn allow(&self, device: &str) {
        self.denied.write().remove(device);
    }
}

impl PermissionChecker for DeviceDenyList {
    fn check(&self, _store: &StoreInfo, device: &str, flag: CheckFlag) -> bool {
        match self.denied.read().get(device) {
            Some(denied) => match flag {
                CheckFlag::Both => false,
                single => !denied.covers(single),
            },
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_for_modes() {
        assert_eq!(CheckFlag::for_mode(SyncMode::Push), CheckFlag::Send);
        assert_eq!(CheckFlag::for_mode(SyncMode::AutoPull), CheckFlag::Receive);
        assert_eq!(CheckFlag::for_mode(SyncMode::PushAndPull), CheckFlag::Both);
        assert_eq!(CheckFlag::for_mode(SyncMode::ResponsePull), CheckFlag::Send);
        assert_eq!(CheckFlag::for_remote_mode(SyncMode::Push), CheckFlag::Receive);
        assert_eq!(CheckFlag::for_remote_mode(SyncMode::Pull), CheckFlag::Send);
    }

    #[test]
    fn deny_list() {
        let store = StoreInfo::new("user", "app", "store");
        let checker = DeviceDenyList::new();
        assert!(checker.check(&store, "a", CheckFlag::Both));

        checker.deny("a", CheckFlag::Receive);
        assert!(checker.check(&store, "a", CheckFlag::Send));
        assert!(!checker.check(&store, "a", CheckFlag::Receive));
        assert!(!checker.check(&store, "a", CheckFlag::Both));
        assert!(checker.check(&store, "b", CheckFlag::Receive));

        checker.allow("a");
        assert!(checker.check(&store, "a", CheckFlag::Receive));
    }

    #[test]
    fn allow_all() {
        assert!(AllowAll.check(&StoreInfo::default(), "x", CheckFlag::Both));
    }
}
