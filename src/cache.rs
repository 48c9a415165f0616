//! Per-peer request bookkeeping.
//!
//! Records that a peer already satisfied (or was served) a given request
//! kind, so each sync ask happens at most once per TTL interval per peer.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::chain::wall_time;
use crate::primitives::NetAddress;

/// Request kinds used throughout the subsystem.
pub mod request {
    pub const SPORK_SYNC: &str = "spork-sync";
    pub const FULL_SYNC: &str = "full-sync";
    pub const LIST_SYNC: &str = "service-node-list-sync";
    pub const PAYMENT_SYNC: &str = "service-node-payment-sync";
    /// Serving-side guard; distinct from the asking-side key so a mutual
    /// sync between two nodes is not mistaken for abuse.
    pub const PAYMENT_SYNC_SERVE: &str = "fnpaymentsync";
    pub const VERIFY_REQUEST: &str = "mnverify-request";
    pub const VERIFY_REPLY: &str = "mnverify-reply";
    pub const VERIFY_DONE: &str = "mnverify-done";
}

/// Expiring `(peer, request-kind)` set.
pub struct FulfilledRequestCache {
    ttl: i64,
    entries: Mutex<BTreeMap<NetAddress, BTreeMap<String, i64>>>,
}

impl FulfilledRequestCache {
    pub fn new(ttl: i64) -> Self {
        FulfilledRequestCache { ttl, entries: Mutex::new(BTreeMap::new()) }
    }

    pub fn has(&self, addr: &NetAddress, kind: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .get(addr)
            .and_then(|kinds| kinds.get(kind))
            .map(|&expiry| expiry > wall_time())
            .unwrap_or(false)
    }

    pub fn add(&self, addr: NetAddress, kind: &str) {
        let mut entries = self.entries.lock();
        entries.entry(addr).or_default().insert(kind.to_string(), wall_time() + self.ttl);
    }

    /// Drop all records for a disconnected peer.
    pub fn remove_all_for(&self, addr: &NetAddress) {
        self.entries.lock().remove(addr);
    }

    /// Sweep expired entries; called from periodic housekeeping.
    pub fn check_and_remove(&self) {
        let now = wall_time();
        let mut entries = self.entries.lock();
        entries.retain(|_, kinds| {
            kinds.retain(|_, &mut expiry| expiry > now);
            !kinds.is_empty()
        });
    }

    #[cfg(test)]
    fn add_with_expiry(&self, addr: NetAddress, kind: &str, expiry: i64) {
        self.entries.lock().entry(addr).or_default().insert(kind.to_string(), expiry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> NetAddress {
        NetAddress::new_ipv4(Ipv4Addr::new(10, 0, 0, last), 12919)
    }

    #[test]
    fn add_then_has() {
        let cache = FulfilledRequestCache::new(3600);
        assert!(!cache.has(&addr(1), request::SPORK_SYNC));
        cache.add(addr(1), request::SPORK_SYNC);
        assert!(cache.has(&addr(1), request::SPORK_SYNC));
        assert!(!cache.has(&addr(1), request::LIST_SYNC));
        assert!(!cache.has(&addr(2), request::SPORK_SYNC));
    }

    #[test]
    fn expired_entries_are_swept() {
        let cache = FulfilledRequestCache::new(3600);
        cache.add_with_expiry(addr(1), request::LIST_SYNC, wall_time() - 1);
        cache.add(addr(1), request::SPORK_SYNC);
        assert!(!cache.has(&addr(1), request::LIST_SYNC));
        cache.check_and_remove();
        assert!(cache.has(&addr(1), request::SPORK_SYNC));
        assert!(!cache.has(&addr(1), request::LIST_SYNC));
    }

    #[test]
    fn remove_all_for_peer() {
        let cache = FulfilledRequestCache::new(3600);
        cache.add(addr(1), request::SPORK_SYNC);
        cache.add(addr(1), request::LIST_SYNC);
        cache.remove_all_for(&addr(1));
        assert!(!cache.has(&addr(1), request::SPORK_SYNC));
        assert!(!cache.has(&addr(1), request::LIST_SYNC));
    }
}
