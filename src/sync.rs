//! Staged synchronization of service-node data.
//!
//! Assets are synced in order: wait out the blockchain, then the registry
//! list, then the payment votes. All state is atomic; the driver never
//! holds a lock across a peer send, so every other component can consult
//! it freely.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::cache::request;
use crate::chain::wall_time;
use crate::net::{Message, PeerBus};
use crate::params::Network;
use crate::payments::PaymentLedger;
use crate::registry::ServiceNodeRegistry;

pub const SYNC_FAILED: i32 = -1;
pub const SYNC_INITIAL: i32 = 0;
pub const SYNC_WAITING: i32 = 1;
pub const SYNC_LIST: i32 = 2;
pub const SYNC_VOTES: i32 = 3;
pub const SYNC_FINISHED: i32 = 999;

/// Tick cadence expected from the scheduler.
pub const TICK_SECONDS: i64 = 6;
/// Per-asset timeout, reset by every relevant inbound message.
pub const TIMEOUT_SECONDS: i64 = 30;
/// Cool-down after a failed sync before starting over.
const FAIL_RETRY_SECONDS: i64 = 60;
/// A tick gap this large means the process was suspended.
const SUSPEND_RESET_SECONDS: i64 = 60 * 60;
/// How many peers we ask per asset.
const MAX_PEERS_PER_ASSET: i32 = 3;

/// Progress callback toward a UI.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// What a tick asks the caller to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncTickOutcome {
    /// The final asset completed on this tick; run the local controller.
    pub finished_now: bool,
}

pub struct SyncDriver {
    network: Network,
    service_node_mode: bool,
    asset: AtomicI32,
    attempt: AtomicI32,
    time_asset_started: AtomicI64,
    time_last_bumped: AtomicI64,
    time_last_failure: AtomicI64,
    time_last_process: AtomicI64,
    reached_best_header: AtomicBool,
    progress: Mutex<Option<ProgressFn>>,
}

impl SyncDriver {
    pub fn new(network: Network, service_node_mode: bool) -> Self {
        let now = wall_time();
        SyncDriver {
            network,
            service_node_mode,
            asset: AtomicI32::new(SYNC_INITIAL),
            attempt: AtomicI32::new(0),
            time_asset_started: AtomicI64::new(now),
            time_last_bumped: AtomicI64::new(now),
            time_last_failure: AtomicI64::new(0),
            time_last_process: AtomicI64::new(now),
            reached_best_header: AtomicBool::new(false),
            progress: Mutex::new(None),
        }
    }

    pub fn set_progress_callback(&self, callback: ProgressFn) {
        *self.progress.lock() = Some(callback);
    }

    pub fn asset(&self) -> i32 {
        self.asset.load(Ordering::Relaxed)
    }

    /// Jump straight to an asset; test fixtures only.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn force_asset(&self, asset: i32) {
        self.asset.store(asset, Ordering::Relaxed);
    }

    pub fn attempt(&self) -> i32 {
        self.attempt.load(Ordering::Relaxed)
    }

    pub fn is_failed(&self) -> bool {
        self.asset() == SYNC_FAILED
    }

    pub fn is_blockchain_synced(&self) -> bool {
        self.asset() > SYNC_WAITING
    }

    pub fn is_list_synced(&self) -> bool {
        self.asset() > SYNC_LIST
    }

    pub fn is_winners_list_synced(&self) -> bool {
        self.asset() > SYNC_VOTES
    }

    pub fn is_synced(&self) -> bool {
        self.asset() == SYNC_FINISHED
    }

    pub fn asset_name(&self) -> &'static str {
        match self.asset() {
            SYNC_INITIAL => "SYNC_INITIAL",
            SYNC_WAITING => "SYNC_WAITING",
            SYNC_LIST => "SYNC_LIST",
            SYNC_VOTES => "SYNC_VOTES",
            SYNC_FAILED => "SYNC_FAILED",
            SYNC_FINISHED => "SYNC_FINISHED",
            _ => "UNKNOWN",
        }
    }

    /// Human-readable sync status for the UI.
    pub fn status(&self) -> &'static str {
        match self.asset() {
            SYNC_INITIAL => "Synchronizing blockchain...",
            SYNC_WAITING => "Synchronization pending...",
            SYNC_LIST => "Synchronizing service nodes...",
            SYNC_VOTES => "Synchronizing service node payments...",
            SYNC_FAILED => "Synchronization failed",
            SYNC_FINISHED => "Synchronization finished",
            _ => "",
        }
    }

    fn fail(&self) {
        self.time_last_failure.store(wall_time(), Ordering::Relaxed);
        self.asset.store(SYNC_FAILED, Ordering::Relaxed);
        tracing::warn!(target: "sync", "sync failed");
    }

    pub fn reset(&self) {
        let now = wall_time();
        self.asset.store(SYNC_INITIAL, Ordering::Relaxed);
        self.attempt.store(0, Ordering::Relaxed);
        self.time_asset_started.store(now, Ordering::Relaxed);
        self.time_last_bumped.store(now, Ordering::Relaxed);
        self.time_last_failure.store(0, Ordering::Relaxed);
    }

    /// Postpone the current asset's timeout; called by every message
    /// handler that makes sync progress.
    pub fn bump_asset_last_time(&self, source: &str) {
        if self.is_synced() || self.is_failed() {
            return;
        }
        self.time_last_bumped.store(wall_time(), Ordering::Relaxed);
        tracing::trace!(target: "sync", source, "bumped asset last time");
    }

    /// Advance to the next asset. Returns true when the final asset just
    /// completed.
    fn switch_to_next_asset(
        &self,
        bus: &dyn PeerBus,
        fulfilled: &crate::cache::FulfilledRequestCache,
    ) -> bool {
        let asset = self.asset();
        let elapsed = wall_time() - self.time_asset_started.load(Ordering::Relaxed);
        let mut finished = false;
        let next = match asset {
            SYNC_FAILED => {
                // must reset first; getting here is a programming error
                panic!("can't switch to next asset from failed, use reset first");
            }
            SYNC_INITIAL => SYNC_WAITING,
            SYNC_WAITING => SYNC_LIST,
            SYNC_LIST => SYNC_VOTES,
            _ => {
                finished = true;
                SYNC_FINISHED
            }
        };
        if asset != SYNC_INITIAL {
            tracing::info!(target: "sync", asset = self.asset_name(), elapsed,
                "completed sync asset");
        }
        self.asset.store(next, Ordering::Relaxed);
        self.attempt.store(0, Ordering::Relaxed);
        self.time_asset_started.store(wall_time(), Ordering::Relaxed);
        self.bump_asset_last_time("sync::switch_to_next_asset");
        tracing::info!(target: "sync", asset = self.asset_name(), "starting sync asset");

        if finished {
            self.report_progress(1.0);
            // enable rotation: these peers served us a full sync
            for peer in bus.peers() {
                fulfilled.add(peer.addr(), request::FULL_SYNC);
            }
            tracing::info!(target: "sync", "sync has finished");
        }
        finished
    }

    fn report_progress(&self, progress: f64) {
        if let Some(callback) = self.progress.lock().as_ref() {
            callback(progress);
        }
    }

    /// Sync-status counts are informational only.
    pub fn process_sync_status_count(&self, item_id: i32, count: i32, peer_id: u64) {
        if self.is_synced() || self.is_failed() {
            return;
        }
        tracing::info!(target: "sync", item_id, count, peer = peer_id,
            "got inventory count");
    }

    /// One driver tick. The caller invokes this every `TICK_SECONDS`.
    pub fn process_tick(
        &self,
        registry: &ServiceNodeRegistry,
        ledger: &PaymentLedger,
        fulfilled: &crate::cache::FulfilledRequestCache,
        bus: &dyn PeerBus,
    ) -> SyncTickOutcome {
        let now = wall_time();
        let mut outcome = SyncTickOutcome::default();

        // the process was suspended for too long: start over
        let last_process = self.time_last_process.swap(now, Ordering::Relaxed);
        if now - last_process > SUSPEND_RESET_SECONDS {
            tracing::warn!(target: "sync", "no actions for too long, restarting sync");
            self.reset();
            outcome.finished_now = self.switch_to_next_asset(bus, fulfilled);
            return outcome;
        }

        if self.is_failed() {
            if self.time_last_failure.load(Ordering::Relaxed) + FAIL_RETRY_SECONDS < now {
                tracing::warn!(target: "sync", "failed to sync, trying again");
                self.reset();
                outcome.finished_now = self.switch_to_next_asset(bus, fulfilled);
            }
            return outcome;
        }

        if self.is_synced() {
            // keep marking peers so fresh connections rotate out too
            for peer in bus.peers() {
                fulfilled.add(peer.addr(), request::FULL_SYNC);
            }
            return outcome;
        }

        let progress =
            (self.attempt() as f64 + (self.asset() as f64 - 1.0) * 8.0) / (8.0 * 4.0);
        tracing::info!(target: "sync", asset = self.asset(), attempt = self.attempt(),
            progress, "sync tick");
        self.report_progress(progress);

        for peer in bus.peers() {
            // temporary service-node connections are unreliable for sync;
            // an inbound connection this early is most likely one of those
            // from the other side
            if peer.is_service_node_conn() || (self.service_node_mode && peer.is_inbound()) {
                continue;
            }

            // quick mode for regression tests: count attempts, skip timers
            if self.network == Network::Regtest {
                let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);
                if attempt <= 2 {
                    peer.send(Message::GetSporks);
                } else if attempt < 4 {
                    registry.request_full_list(&*peer);
                } else if attempt < 6 {
                    peer.send(Message::PaymentSync {
                        legacy_count: ledger.storage_limit(registry.size()),
                    });
                } else {
                    self.asset.store(SYNC_FINISHED, Ordering::Relaxed);
                }
                return outcome;
            }

            if fulfilled.has(&peer.addr(), request::FULL_SYNC) {
                // we already synced from this one recently; free the slot
                tracing::info!(target: "sync", peer = peer.id(),
                    "disconnecting from recently synced peer");
                peer.disconnect();
                continue;
            }

            // always ask for sporks first, once per peer
            if !fulfilled.has(&peer.addr(), request::SPORK_SYNC) {
                fulfilled.add(peer.addr(), request::SPORK_SYNC);
                peer.send(Message::GetSporks);
            }

            let timed_out =
                now - self.time_last_bumped.load(Ordering::Relaxed) > TIMEOUT_SECONDS;

            match self.asset() {
                SYNC_WAITING => {
                    if timed_out {
                        // at this point there are peers and no new blocks
                        // or headers arrived for a whole timeout window:
                        // we must be at the tip, move on
                        self.switch_to_next_asset(bus, fulfilled);
                    }
                }
                SYNC_LIST => {
                    if timed_out {
                        if self.attempt() == 0 {
                            tracing::warn!(target: "sync", asset = self.asset_name(),
                                "failed to sync, no peer served the list");
                            // no way to continue without the list
                            self.fail();
                            return outcome;
                        }
                        self.switch_to_next_asset(bus, fulfilled);
                        return outcome;
                    }
                    if self.attempt() > MAX_PEERS_PER_ASSET - 1 {
                        return outcome;
                    }
                    if fulfilled.has(&peer.addr(), request::LIST_SYNC) {
                        continue;
                    }
                    fulfilled.add(peer.addr(), request::LIST_SYNC);
                    if peer.version() < ledger.min_payment_proto() {
                        continue;
                    }
                    self.attempt.fetch_add(1, Ordering::Relaxed);
                    registry.request_full_list(&*peer);
                    // one request per tick keeps the asks spread out
                    return outcome;
                }
                SYNC_VOTES => {
                    // this can take longer than the timeout due to new
                    // blocks, but it does time out eventually
                    if timed_out {
                        if self.attempt() == 0 {
                            tracing::warn!(target: "sync", asset = self.asset_name(),
                                "failed to sync, no peer served the votes");
                            // not a good idea to proceed without a winners
                            // list either
                            self.fail();
                            return outcome;
                        }
                        outcome.finished_now = self.switch_to_next_asset(bus, fulfilled);
                        return outcome;
                    }
                    // if the ledger already holds enough blocks and votes,
                    // move on, but try at least two peers first
                    if self.attempt() > 1 && ledger.is_enough_data(registry.size()) {
                        tracing::info!(target: "sync", "found enough payment data");
                        outcome.finished_now = self.switch_to_next_asset(bus, fulfilled);
                        return outcome;
                    }
                    if self.attempt() > MAX_PEERS_PER_ASSET - 1 {
                        return outcome;
                    }
                    if fulfilled.has(&peer.addr(), request::PAYMENT_SYNC) {
                        continue;
                    }
                    fulfilled.add(peer.addr(), request::PAYMENT_SYNC);
                    if peer.version() < ledger.min_payment_proto() {
                        continue;
                    }
                    self.attempt.fetch_add(1, Ordering::Relaxed);

                    // new peers only return votes for future payments; ask
                    // for the missing pieces explicitly afterwards
                    peer.send(Message::PaymentSync {
                        legacy_count: ledger.storage_limit(registry.size()),
                    });
                    ledger.request_low_data_payment_blocks(&*peer, registry.size(), self);
                    return outcome;
                }
                _ => {}
            }
        }
        outcome
    }

    /// A header was accepted while we are still syncing the chain.
    pub fn accepted_block_header(&self) {
        if !self.is_blockchain_synced() {
            self.bump_asset_last_time("sync::accepted_block_header");
        }
    }

    pub fn notify_header_tip(&self) {
        if self.is_failed() || self.is_synced() {
            return;
        }
        if !self.is_blockchain_synced() {
            self.bump_asset_last_time("sync::notify_header_tip");
        }
    }

    /// Tip update from the consensus layer. `best_header` says whether
    /// the new tip is also our best known header.
    pub fn updated_block_tip(
        &self,
        initial_download: bool,
        best_header: bool,
        bus: &dyn PeerBus,
        fulfilled: &crate::cache::FulfilledRequestCache,
    ) {
        if self.is_failed() || self.is_synced() {
            return;
        }

        if !self.is_blockchain_synced() {
            self.bump_asset_last_time("sync::updated_block_tip");
        }

        if initial_download {
            // switched too early
            if self.is_blockchain_synced() {
                self.reset();
            }
            return;
        }

        let reached_before = self.reached_best_header.swap(best_header, Ordering::Relaxed);
        if reached_before && !best_header {
            // flipping back means we were stuck syncing headers earlier;
            // there is no tip update without a best header
            self.reset();
            return;
        }

        if !self.is_blockchain_synced() && best_header {
            // reached the best header while waiting: we are at the tip
            self.switch_to_next_asset(bus, fulfilled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockBus;

    #[test]
    fn flags_follow_asset() {
        let sync = SyncDriver::new(Network::Mainnet, false);
        assert!(!sync.is_blockchain_synced());
        assert!(!sync.is_list_synced());
        sync.asset.store(SYNC_LIST, Ordering::Relaxed);
        assert!(sync.is_blockchain_synced());
        assert!(!sync.is_list_synced());
        sync.asset.store(SYNC_VOTES, Ordering::Relaxed);
        assert!(sync.is_list_synced());
        assert!(!sync.is_winners_list_synced());
        sync.asset.store(SYNC_FINISHED, Ordering::Relaxed);
        assert!(sync.is_winners_list_synced());
        assert!(sync.is_synced());
    }

    #[test]
    fn linear_progression_and_finish() {
        let bus = MockBus::new();
        let fulfilled = crate::cache::FulfilledRequestCache::new(3600);
        let sync = SyncDriver::new(Network::Mainnet, false);
        assert!(!sync.switch_to_next_asset(&bus, &fulfilled)); // -> waiting
        assert_eq!(sync.asset(), SYNC_WAITING);
        assert!(!sync.switch_to_next_asset(&bus, &fulfilled)); // -> list
        assert!(!sync.switch_to_next_asset(&bus, &fulfilled)); // -> votes
        assert!(sync.switch_to_next_asset(&bus, &fulfilled)); // -> finished
        assert!(sync.is_synced());
    }

    #[test]
    fn failure_recovers_after_cooldown() {
        let bus = MockBus::new();
        let sync = SyncDriver::new(Network::Mainnet, false);
        sync.asset.store(SYNC_LIST, Ordering::Relaxed);
        sync.fail();
        assert!(sync.is_failed());

        // no recovery inside the cooldown
        sync.time_last_failure.store(wall_time(), Ordering::Relaxed);
        let registry = crate::test_utils::test_registry();
        let ledger = crate::test_utils::test_ledger();
        let fulfilled = crate::cache::FulfilledRequestCache::new(3600);
        sync.process_tick(&registry, &ledger, &fulfilled, &bus);
        assert!(sync.is_failed());

        // after the cooldown the driver resets and starts over
        sync.time_last_failure.store(wall_time() - FAIL_RETRY_SECONDS - 1, Ordering::Relaxed);
        sync.process_tick(&registry, &ledger, &fulfilled, &bus);
        assert_eq!(sync.asset(), SYNC_WAITING);
    }

    #[test]
    fn bump_is_ignored_when_done() {
        let sync = SyncDriver::new(Network::Mainnet, false);
        sync.asset.store(SYNC_FINISHED, Ordering::Relaxed);
        let before = sync.time_last_bumped.load(Ordering::Relaxed);
        sync.time_last_bumped.store(before - 100, Ordering::Relaxed);
        sync.bump_asset_last_time("test");
        assert_eq!(sync.time_last_bumped.load(Ordering::Relaxed), before - 100);
    }
}
