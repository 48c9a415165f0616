//! The replicated service-node registry.
//!
//! Single lock over the whole registry state; public methods lock once at
//! entry and never recurse. Cross-component calls observe the documented
//! order: chain state is read lock-free through the adapter, the payment
//! ledger's locks nest inside the registry lock, never the reverse.

pub mod announce;
pub mod node;
pub mod verify;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin_hashes::Hash;
use parking_lot::Mutex;

use crate::cache::{request, FulfilledRequestCache};
use crate::chain::{wall_time, ChainAdapter};
use crate::error::RegistryError;
use crate::hash_types::{AnnounceHash, BlockHash, GovernanceHash, PingHash, ScoreHash, VerifyHash};
use crate::net::{Inv, InvKind, Message, Peer, PeerBus};
use crate::params::{
    self, NetworkParams, SporkSet, DSEG_UPDATE_SECONDS, EXPIRATION_SECONDS, MAX_POSE_BLOCKS,
    MAX_POSE_CONNECTIONS, MAX_POSE_RANK, MIN_ANNOUNCE_SECONDS, MIN_PING_SECONDS,
    MIN_POSE_PROTO_VERSION, NEW_START_REQUIRED_SECONDS, PENDING_CONNECT_SECONDS,
    POSE_BAN_MAX_SCORE, RECOVERY_MAX_ASK_ENTRIES, RECOVERY_QUORUM_REQUIRED,
    RECOVERY_QUORUM_TOTAL, RECOVERY_RETRY_SECONDS, RECOVERY_WAIT_SECONDS,
    SENTINEL_PING_MAX_SECONDS,
};
use crate::payments::PaymentLedger;
use crate::primitives::{NetAddress, OutPoint, PubKey, ScriptBuf};
use crate::sync::{SyncDriver, SYNC_LIST};

pub use announce::{ServiceNodeAnnounce, ServiceNodePing};
pub use node::{CheckContext, CollateralStatus, ServiceNode, ServiceNodeInfo, ServiceNodeState};
pub use verify::ServiceNodeVerification;

/// Upper bound for verification nonces.
const VERIFY_NONCE_RANGE: i32 = 999_999;

/// What a processed announce asks the caller to do next.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceOutcome {
    /// The announce was accepted; its address is worth adding to the
    /// address manager.
    pub accepted: bool,
    /// The announce matched our own operator key at the current protocol;
    /// the caller should run the local controller's state machine.
    pub trigger_self_activation: bool,
}

/// The local service-node identity, handed in by the controller for the
/// paths that sign or self-match.
#[derive(Clone)]
pub struct LocalIdentity {
    pub outpoint: OutPoint,
    pub operator: crate::crypto::OperatorKeyPair,
}

#[derive(Default)]
struct RegistryState {
    cached_height: i32,
    nodes: BTreeMap<OutPoint, ServiceNode>,
    /// Who asked us for the full list, and until when that ask counts.
    asked_us_for_list: BTreeMap<NetAddress, i64>,
    /// Who we asked for the full list.
    we_asked_for_list: BTreeMap<NetAddress, i64>,
    /// Which single entries we asked which peers for.
    we_asked_for_entry: BTreeMap<OutPoint, BTreeMap<NetAddress, i64>>,
    /// Outstanding verification challenges by target address.
    we_asked_for_verification: BTreeMap<NetAddress, ServiceNodeVerification>,
    /// Recovery quorum bookkeeping for nodes in NewStartRequired.
    recovery_requests: BTreeMap<AnnounceHash, (i64, BTreeSet<NetAddress>)>,
    recovery_good_replies: BTreeMap<AnnounceHash, Vec<ServiceNodeAnnounce>>,
    scheduled_recovery_connections: Vec<(NetAddress, AnnounceHash)>,
    pending_recovery: BTreeMap<NetAddress, (i64, BTreeSet<AnnounceHash>)>,
    pending_verifications: BTreeMap<NetAddress, (i64, ServiceNodeVerification)>,
    seen_announces: BTreeMap<AnnounceHash, (i64, ServiceNodeAnnounce)>,
    seen_pings: BTreeMap<PingHash, ServiceNodePing>,
    seen_verifications: BTreeMap<VerifyHash, ServiceNodeVerification>,
    nodes_added: bool,
    nodes_removed: bool,
    dirty_governance_hashes: Vec<GovernanceHash>,
    last_sentinel_ping_time: i64,
    dsq_count: i64,
    last_paid_run_height: i32,
    warned_daemon_updates: bool,
}

/// The in-memory map of currently known service nodes and every piece of
/// gossip bookkeeping that hangs off it.
pub struct ServiceNodeRegistry {
    chain: Arc<dyn ChainAdapter>,
    params: NetworkParams,
    sporks: Arc<SporkSet>,
    fulfilled: Arc<FulfilledRequestCache>,
    shutdown: Arc<AtomicBool>,
    state: Mutex<RegistryState>,
}

impl ServiceNodeRegistry {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        params: NetworkParams,
        sporks: Arc<SporkSet>,
        fulfilled: Arc<FulfilledRequestCache>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        ServiceNodeRegistry {
            chain,
            params,
            sporks,
            fulfilled,
            shutdown,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn cached_height(&self) -> i32 {
        self.state.lock().cached_height
    }

    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().nodes.contains_key(outpoint)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<ServiceNode> {
        self.state.lock().nodes.get(outpoint).cloned()
    }

    pub fn get_info(&self, outpoint: &OutPoint) -> Option<ServiceNodeInfo> {
        self.state.lock().nodes.get(outpoint).map(|node| node.info())
    }

    pub fn get_info_by_operator_key(&self, pubkey: &PubKey) -> Option<ServiceNodeInfo> {
        let state = self.state.lock();
        state.nodes.values().find(|node| node.pubkey_operator == *pubkey).map(|node| node.info())
    }

    pub fn get_info_by_payee(&self, payee: &ScriptBuf) -> Option<ServiceNodeInfo> {
        let state = self.state.lock();
        state.nodes.values().find(|node| node.payee_script() == *payee).map(|node| node.info())
    }

    pub fn count_service_nodes(&self, min_proto: Option<u32>) -> usize {
        let min_proto = min_proto.unwrap_or_else(|| self.sporks.min_payment_proto());
        let state = self.state.lock();
        state.nodes.values().filter(|node| node.protocol_version >= min_proto).count()
    }

    pub fn count_enabled(&self, min_proto: Option<u32>) -> usize {
        let min_proto = min_proto.unwrap_or_else(|| self.sporks.min_payment_proto());
        let state = self.state.lock();
        state
            .nodes
            .values()
            .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
            .count()
    }

    /// Full copy of the registry map, for RPC-style listings.
    pub fn full_map(&self) -> BTreeMap<OutPoint, ServiceNode> {
        self.state.lock().nodes.clone()
    }

    fn add(state: &mut RegistryState, node: ServiceNode) -> bool {
        if state.nodes.contains_key(&node.outpoint) {
            return false;
        }
        tracing::debug!(target: "registry", addr = %node.addr, total = state.nodes.len() + 1,
            "adding new service node");
        state.nodes.insert(node.outpoint, node);
        state.nodes_added = true;
        true
    }

    // ---- sentinel -------------------------------------------------------

    pub fn update_last_sentinel_ping_time(&self) {
        self.state.lock().last_sentinel_ping_time = wall_time();
    }

    pub fn is_sentinel_ping_active(&self) -> bool {
        let state = self.state.lock();
        wall_time() - state.last_sentinel_ping_time <= SENTINEL_PING_MAX_SECONDS
    }

    // ---- mixing / governance hooks -------------------------------------

    pub fn allow_mixing(&self, outpoint: &OutPoint) -> bool {
        let mut state = self.state.lock();
        state.dsq_count += 1;
        let dsq = state.dsq_count;
        match state.nodes.get_mut(outpoint) {
            Some(node) => {
                node.last_dsq = dsq;
                node.allow_mixing = true;
                true
            }
            None => false,
        }
    }

    pub fn disallow_mixing(&self, outpoint: &OutPoint) -> bool {
        let mut state = self.state.lock();
        match state.nodes.get_mut(outpoint) {
            Some(node) => {
                node.allow_mixing = false;
                true
            }
            None => false,
        }
    }

    pub fn pose_ban(&self, outpoint: &OutPoint) -> bool {
        let mut state = self.state.lock();
        match state.nodes.get_mut(outpoint) {
            Some(node) => {
                node.pose_ban();
                true
            }
            None => false,
        }
    }

    pub fn add_governance_vote(&self, outpoint: &OutPoint, hash: GovernanceHash) -> bool {
        let mut state = self.state.lock();
        match state.nodes.get_mut(outpoint) {
            Some(node) => {
                node.add_governance_vote(hash);
                true
            }
            None => false,
        }
    }

    pub fn remove_governance_object(&self, hash: &GovernanceHash) {
        let mut state = self.state.lock();
        for node in state.nodes.values_mut() {
            node.remove_governance_object(hash);
        }
    }

    pub fn add_dirty_governance_hash(&self, hash: GovernanceHash) {
        self.state.lock().dirty_governance_hashes.push(hash);
    }

    pub fn take_dirty_governance_hashes(&self) -> Vec<GovernanceHash> {
        std::mem::take(&mut self.state.lock().dirty_governance_hashes)
    }

    /// Added/removed flags since the last call, for governance
    /// notifications.
    pub fn take_update_flags(&self) -> (bool, bool) {
        let mut state = self.state.lock();
        let flags = (state.nodes_added, state.nodes_removed);
        state.nodes_added = false;
        state.nodes_removed = false;
        flags
    }

    // ---- checks ---------------------------------------------------------

    fn check_context(&self, state: &RegistryState, sync: &SyncDriver, our_key: Option<&PubKey>)
        -> CheckContext
    {
        CheckContext {
            network: self.params.network,
            tip_height: state.cached_height,
            adjusted_time: self.chain.adjusted_time(),
            now: wall_time(),
            registry_size: state.nodes.len(),
            min_payment_proto: self.sporks.min_payment_proto(),
            list_synced: sync.is_list_synced(),
            sentinel_active: sync.is_synced()
                && wall_time() - state.last_sentinel_ping_time <= SENTINEL_PING_MAX_SECONDS,
            our_operator_key: our_key.cloned(),
        }
    }

    /// Re-check every node. Individual nodes rate-limit themselves.
    pub fn check(&self, sync: &SyncDriver, local: Option<&LocalIdentity>) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.state.lock();
        let ctx = self.check_context(&state, sync, local.map(|l| l.operator.public_key()));
        for node in state.nodes.values_mut() {
            node.check(&ctx, false);
        }
    }

    /// Force-check the node carrying this operator key.
    pub fn check_service_node(
        &self,
        pubkey: &PubKey,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
    ) {
        let mut state = self.state.lock();
        let ctx = self.check_context(&state, sync, local.map(|l| l.operator.public_key()));
        if let Some(node) =
            state.nodes.values_mut().find(|node| node.pubkey_operator == *pubkey)
        {
            node.check(&ctx, true);
        }
    }

    pub fn is_pinged_within(&self, outpoint: &OutPoint, seconds: i64, at: Option<i64>) -> bool {
        let at = at.unwrap_or_else(|| self.chain.adjusted_time());
        let state = self.state.lock();
        state.nodes.get(outpoint).map(|node| node.is_pinged_within(seconds, at)).unwrap_or(false)
    }

    /// Install a locally originated ping, mirroring what acceptance of a
    /// relayed ping would have done.
    pub fn set_last_ping(&self, outpoint: &OutPoint, ping: ServiceNodePing) {
        let new_sigs = self.sporks.is_new_sigs_active();
        let mut state = self.state.lock();
        if ping.sentinel_is_current {
            state.last_sentinel_ping_time = wall_time();
        }
        state.seen_pings.insert(ping.hash(new_sigs), ping.clone());
        let announce_hash = match state.nodes.get_mut(outpoint) {
            Some(node) => {
                node.last_ping = Some(ping.clone());
                announce_from_node(node).hash()
            }
            None => return,
        };
        if let Some((_, seen)) = state.seen_announces.get_mut(&announce_hash) {
            seen.last_ping = ping;
        }
    }

    // ---- scores and ranks ----------------------------------------------

    fn scores<'a>(
        state: &'a RegistryState,
        block_hash: &BlockHash,
        min_proto: u32,
    ) -> Vec<(ScoreHash, &'a ServiceNode)> {
        let mut scores: Vec<(ScoreHash, &ServiceNode)> = state
            .nodes
            .values()
            .filter(|node| node.protocol_version >= min_proto)
            .map(|node| (node.calculate_score(block_hash), node))
            .collect();
        // highest score first, ties broken by outpoint, both descending
        scores.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.outpoint.cmp(&a.1.outpoint)));
        scores
    }

    /// Rank of one node at a block height, starting at 1.
    pub fn get_rank(
        &self,
        outpoint: &OutPoint,
        block_height: i32,
        min_proto: u32,
        sync: &SyncDriver,
    ) -> Option<usize> {
        if !sync.is_list_synced() {
            return None;
        }
        let block_hash = self.chain.block_hash(block_height)?;
        let state = self.state.lock();
        Self::scores(&state, &block_hash, min_proto)
            .iter()
            .position(|(_, node)| node.outpoint == *outpoint)
            .map(|idx| idx + 1)
    }

    /// The full ranking at a block height.
    pub fn get_ranks(
        &self,
        block_height: i32,
        min_proto: u32,
        sync: &SyncDriver,
    ) -> Option<Vec<(usize, ServiceNodeInfo)>> {
        if !sync.is_list_synced() {
            return None;
        }
        let block_hash = self.chain.block_hash(block_height)?;
        let state = self.state.lock();
        let scores = Self::scores(&state, &block_hash, min_proto);
        if scores.is_empty() {
            return None;
        }
        Some(
            scores
                .into_iter()
                .enumerate()
                .map(|(idx, (_, node))| (idx + 1, node.info()))
                .collect(),
        )
    }

    /// A random enabled node outside the exclusion list, used by the
    /// mixing client to pick queue candidates.
    pub fn find_random_not_in_vec(
        &self,
        exclude: &[OutPoint],
        min_proto: Option<u32>,
    ) -> Option<ServiceNodeInfo> {
        let min_proto = min_proto.unwrap_or_else(|| self.sporks.min_payment_proto());
        let state = self.state.lock();

        let enabled = state
            .nodes
            .values()
            .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
            .count();
        if enabled <= exclude.len() {
            return None;
        }

        let mut candidates: Vec<&ServiceNode> = state.nodes.values().collect();
        // shuffle via repeated adapter draws so tests stay deterministic
        for i in (1..candidates.len()).rev() {
            let j = self.chain.rand_below(i as i32 + 1) as usize;
            candidates.swap(i, j);
        }

        candidates
            .into_iter()
            .filter(|node| node.protocol_version >= min_proto && node.is_enabled())
            .find(|node| !exclude.contains(&node.outpoint))
            .map(|node| node.info())
    }

    // ---- payment queue --------------------------------------------------

    /// Deterministically select the next node to be paid at
    /// `block_height`. Returns the eligible-candidate count alongside.
    pub fn next_payee(
        &self,
        block_height: i32,
        filter_sig_time: bool,
        ledger: &PaymentLedger,
        sync: &SyncDriver,
    ) -> (usize, Option<ServiceNodeInfo>) {
        if !sync.is_winners_list_synced() {
            // without the winners list we cannot reliably elect anyway
            return (0, None);
        }

        let min_proto = self.sporks.min_payment_proto();
        let sentinel_required = self.sporks.is_sentinel_flag_required();
        let adjusted = self.chain.adjusted_time();
        let list_synced = sync.is_list_synced();

        let state = self.state.lock();
        let total = state.nodes.values().filter(|n| n.protocol_version >= min_proto).count();

        let mut last_paid: Vec<(i32, &ServiceNode)> = Vec::new();
        for node in state.nodes.values() {
            if !node.is_valid_for_payment(sentinel_required) {
                continue;
            }
            if node.protocol_version < min_proto {
                continue;
            }
            // already scheduled in the near window: skip to avoid double pay
            if ledger.is_scheduled(&node.payee_script(), block_height, list_synced) {
                continue;
            }
            // too new, wait for a cycle
            if filter_sig_time
                && node.sig_time + (total as i64 * 156) > adjusted
            {
                continue;
            }
            // must be buried at least as deep as the registry is large
            match self.chain.confirmations(&node.outpoint) {
                Some(confs) if confs >= total as i32 => {}
                _ => continue,
            }
            last_paid.push((node.block_last_paid, node));
        }

        let count = last_paid.len();

        // during network upgrades, don't starve recently restarted nodes
        if filter_sig_time && count < total / 3 {
            drop(state);
            return self.next_payee(block_height, false, ledger, sync);
        }

        last_paid.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.outpoint.cmp(&b.1.outpoint)));

        let seed = match self.chain.block_hash(block_height - 101) {
            Some(seed) => seed,
            None => {
                tracing::warn!(target: "payments", height = block_height - 101,
                    "no block hash for payee selection seed");
                return (count, None);
            }
        };

        // look at the least recently paid tenth and take the highest score
        let tenth = total / 10;
        let mut best: Option<(ScoreHash, &ServiceNode)> = None;
        for (seen, (_, node)) in last_paid.iter().enumerate() {
            let score = node.calculate_score(&seed);
            if best.as_ref().map(|(high, _)| score > *high).unwrap_or(true) {
                best = Some((score, node));
            }
            if seen + 1 >= tenth {
                break;
            }
        }

        (count, best.map(|(_, node)| node.info()))
    }

    // ---- announce pipeline ---------------------------------------------

    /// Process an incoming announce: dedup against the retention window,
    /// validate, then create or update the registry entry.
    pub fn process_announce(
        &self,
        from: Option<&dyn Peer>,
        mut announce: ServiceNodeAnnounce,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) -> Result<AnnounceOutcome, RegistryError> {
        let hash = announce.hash();
        if let Some(peer) = from {
            peer.clear_ask_for(&hash.to_byte_array());
        }
        if !sync.is_blockchain_synced() {
            return Ok(AnnounceOutcome::default());
        }
        tracing::debug!(target: "registry", node = %announce.outpoint.to_short_string(),
            "processing service node announce");

        let new_sigs = self.sporks.is_new_sigs_active();
        let min_payment_proto = self.sporks.min_payment_proto();
        let now = wall_time();

        let mut state = self.state.lock();

        if state.seen_announces.contains_key(&hash) && !announce.recovery {
            self.note_seen_announce(&mut state, from, &announce, hash, sync, now);
            return Ok(AnnounceOutcome { accepted: true, ..Default::default() });
        }
        state.seen_announces.insert(hash, (now, announce.clone()));

        announce.simple_check(&*self.chain, self.params.network, min_payment_proto)?;

        if state.nodes.contains_key(&announce.outpoint) {
            let outcome = self.update_existing(&mut state, &announce, hash, sync, local, bus)?;
            return Ok(outcome);
        }

        // short-circuit our own announce: already activated, nothing to do
        if let Some(local) = local {
            if announce.outpoint == local.outpoint
                && announce.pubkey_operator == *local.operator.public_key()
            {
                return Ok(AnnounceOutcome::default());
            }
        }

        let collateral_hash =
            match announce.check_outpoint(&*self.chain, self.params.min_collateral_confirmations) {
                Ok(hash) => hash,
                Err(RegistryError::CollateralTooNew) => {
                    // maybe we miss a few blocks, let this one be retried
                    state.seen_announces.remove(&hash);
                    return Err(RegistryError::CollateralTooNew);
                }
                Err(e) => return Err(e),
            };
        announce.verify_signature(new_sigs)?;

        let mut node = node_from_announce(&announce, collateral_hash);
        let mut outcome = AnnounceOutcome { accepted: true, ..Default::default() };

        // our own fresh announce: remote activation
        if let Some(local) = local {
            if announce.pubkey_operator == *local.operator.public_key() {
                node.pose_ban_score = -POSE_BAN_MAX_SCORE;
                if announce.protocol_version == params::PROTOCOL_VERSION {
                    tracing::info!(target: "registry",
                        node = %announce.outpoint.to_short_string(),
                        "got our own announce entry, activating");
                    outcome.trigger_self_activation = true;
                } else {
                    tracing::warn!(target: "registry",
                        message_proto = announce.protocol_version,
                        "own announce carries a wrong protocol version, re-activate the node");
                    Self::add(&mut state, node);
                    sync.bump_asset_last_time("registry::process_announce");
                    return Ok(AnnounceOutcome::default());
                }
            }
        }

        Self::add(&mut state, node);
        sync.bump_asset_last_time("registry::process_announce");
        bus.relay_inv(Inv::new(InvKind::Announce, hash.to_byte_array()));

        Ok(outcome)
    }

    /// Bookkeeping for an announce we have already seen: refresh the seen
    /// stamp near expiry and collect recovery replies.
    fn note_seen_announce(
        &self,
        state: &mut RegistryState,
        from: Option<&dyn Peer>,
        announce: &ServiceNodeAnnounce,
        hash: AnnounceHash,
        sync: &SyncDriver,
        now: i64,
    ) {
        let seen_time = state.seen_announces.get(&hash).map(|(t, _)| *t).unwrap_or(0);
        if now - seen_time > NEW_START_REQUIRED_SECONDS - MIN_PING_SECONDS * 2 {
            // less than two pings left before non-recoverable, keep it warm
            if let Some((t, _)) = state.seen_announces.get_mut(&hash) {
                *t = now;
            }
            sync.bump_asset_last_time("registry::note_seen_announce");
        }

        let peer = match from {
            Some(peer) => peer,
            None => return,
        };
        let peer_addr = peer.addr();
        let expired = match state.recovery_requests.get_mut(&hash) {
            Some((expiry, requested)) if now < *expiry => {
                if !requested.remove(&peer_addr) {
                    return;
                }
                false
            }
            _ => true,
        };
        if expired {
            return;
        }

        let stored_ping_time = state
            .seen_announces
            .get(&hash)
            .map(|(_, seen)| seen.last_ping.sig_time)
            .unwrap_or(0);
        if announce.last_ping.sig_time <= stored_ping_time {
            return;
        }

        // simulate acceptance to see whether the replier considers the
        // node healthy
        let mut probe = node_from_announce(announce, BlockHash::from_byte_array([0u8; 32]));
        let ctx = self.check_context(state, sync, None);
        probe.check(&ctx, true);
        if probe.state.is_valid_for_auto_start() {
            tracing::debug!(target: "registry", node = %announce.outpoint.to_short_string(),
                from = %peer_addr, "good recovery reply");
            state.recovery_good_replies.entry(hash).or_default().push(announce.clone());
        }
    }

    fn update_existing(
        &self,
        state: &mut RegistryState,
        announce: &ServiceNodeAnnounce,
        hash: AnnounceHash,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) -> Result<AnnounceOutcome, RegistryError> {
        let new_sigs = self.sporks.is_new_sigs_active();
        let now = wall_time();
        let our_key = local.map(|l| l.operator.public_key());
        let ctx = self.check_context(state, sync, our_key);

        let old_hash = {
            let node = state.nodes.get_mut(&announce.outpoint).expect("checked by caller");

            if node.sig_time == announce.sig_time && !announce.recovery {
                // the seen filter catches legit duplicates; right after a
                // restart it can miss, which is fine
                return Ok(AnnounceOutcome::default());
            }
            if node.sig_time > announce.sig_time {
                tracing::warn!(target: "registry",
                    node = %announce.outpoint.to_short_string(),
                    "announce is older than the stored entry, someone is being fishy");
                return Err(RegistryError::StaleSigTime);
            }

            node.check(&ctx, false);

            if node.is_pose_banned() {
                return Err(RegistryError::PoSeBanned);
            }
            if node.pubkey_collateral != announce.pubkey_collateral {
                return Err(RegistryError::CollateralPubkeyMismatch);
            }
            announce.verify_signature(new_sigs)?;

            let ours = our_key.map(|key| announce.pubkey_operator == *key).unwrap_or(false);
            // only replace a recent announce when it is our own node
            if node.is_broadcast_within(MIN_ANNOUNCE_SECONDS, now) && !ours {
                return Ok(AnnounceOutcome { accepted: true, ..Default::default() });
            }

            announce_from_node(node).hash()
        };

        let mut outcome = AnnounceOutcome { accepted: true, ..Default::default() };
        if self.update_from_new_announce(state, announce, local, &mut outcome) {
            let node = state.nodes.get_mut(&announce.outpoint).expect("still present");
            node.check(&ctx, false);
            bus.relay_inv(Inv::new(InvKind::Announce, hash.to_byte_array()));
        }
        sync.bump_asset_last_time("registry::update_existing");

        if hash != old_hash {
            state.seen_announces.remove(&old_hash);
        }
        Ok(outcome)
    }

    /// Overwrite a stored entry from a strictly newer announce.
    fn update_from_new_announce(
        &self,
        state: &mut RegistryState,
        announce: &ServiceNodeAnnounce,
        local: Option<&LocalIdentity>,
        outcome: &mut AnnounceOutcome,
    ) -> bool {
        let new_sigs = self.sporks.is_new_sigs_active();

        let ping_ok = {
            let node = match state.nodes.get_mut(&announce.outpoint) {
                Some(node) => node,
                None => return false,
            };
            if announce.sig_time <= node.sig_time && !announce.recovery {
                return false;
            }
            node.pubkey_operator = announce.pubkey_operator.clone();
            node.sig_time = announce.sig_time;
            node.sig = announce.sig.clone();
            node.protocol_version = announce.protocol_version;
            node.addr = announce.addr;
            node.pose_ban_score = 0;
            node.pose_ban_height = 0;
            node.time_last_checked = 0;

            announce.last_ping.is_null()
                || (announce.last_ping.simple_check(&*self.chain).is_ok()
                    && !node.is_pinged_within(
                        MIN_PING_SECONDS - 60,
                        announce.last_ping.sig_time,
                    )
                    && announce.last_ping.verify(&node.pubkey_operator, new_sigs).is_ok())
        };

        if ping_ok && !announce.last_ping.is_null() {
            let ping_hash = announce.last_ping.hash(new_sigs);
            state.seen_pings.insert(ping_hash, announce.last_ping.clone());
            if let Some(node) = state.nodes.get_mut(&announce.outpoint) {
                node.last_ping = Some(announce.last_ping.clone());
            }
        }

        if let Some(local) = local {
            if announce.pubkey_operator == *local.operator.public_key() {
                let node = state.nodes.get_mut(&announce.outpoint).expect("still present");
                node.pose_ban_score = -POSE_BAN_MAX_SCORE;
                if announce.protocol_version == params::PROTOCOL_VERSION {
                    outcome.trigger_self_activation = true;
                } else {
                    // we need to reactivate with the right protocol; do not
                    // relay, do not punish the sender either
                    tracing::warn!(target: "registry",
                        message_proto = announce.protocol_version,
                        "own announce update carries a wrong protocol version");
                    return false;
                }
            }
        }
        true
    }

    // ---- ping pipeline --------------------------------------------------

    pub fn process_ping(
        &self,
        peer: &dyn Peer,
        ping: ServiceNodePing,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) -> Result<(), RegistryError> {
        let new_sigs = self.sporks.is_new_sigs_active();
        let hash = ping.hash(new_sigs);
        peer.clear_ask_for(&hash.to_byte_array());

        if !sync.is_blockchain_synced() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.seen_pings.contains_key(&hash) {
            return Ok(());
        }
        state.seen_pings.insert(hash, ping.clone());
        tracing::debug!(target: "registry", node = %ping.outpoint.to_short_string(),
            "new service node ping");

        let known = state.nodes.contains_key(&ping.outpoint);
        if known && ping.sentinel_is_current {
            state.last_sentinel_ping_time = wall_time();
        }

        // too late for pings, a new announce is required
        if state
            .nodes
            .get(&ping.outpoint)
            .map(|node| node.is_new_start_required())
            .unwrap_or(false)
        {
            return Ok(());
        }

        match self.ping_check_and_update(&mut state, &ping, false, sync, local, bus) {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.dos_score() == 0 && known {
                    // nothing significant failed and the node is known
                    return Ok(());
                }
                // something significant is broken or the node is unknown,
                // we might have to ask for its announce once
                drop(state);
                self.ask_for_node(peer, &ping.outpoint);
                Err(err)
            }
        }
    }

    fn ping_check_and_update(
        &self,
        state: &mut RegistryState,
        ping: &ServiceNodePing,
        from_announce: bool,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) -> Result<(), RegistryError> {
        let new_sigs = self.sporks.is_new_sigs_active();
        ping.simple_check(&*self.chain)?;

        let node = match state.nodes.get_mut(&ping.outpoint) {
            Some(node) => node,
            None => return Err(RegistryError::UnknownNode),
        };

        if !from_announce {
            if node.is_update_required() {
                return Err(RegistryError::UpdateRequired);
            }
            if node.is_new_start_required() {
                return Err(RegistryError::NewStartRequired);
            }
        }

        let ping_height =
            self.chain.height_of(&ping.block_hash).ok_or(RegistryError::UnknownBlockHash)?;
        if ping_height < self.chain.tip_height() - announce::PING_MAX_BLOCK_AGE {
            return Err(RegistryError::BlockHashTooOld);
        }

        // update only when the previous accepted ping is comfortably old;
        // the 60 s slack stops thrash at the interval boundary
        if node.is_pinged_within(MIN_PING_SECONDS - 60, ping.sig_time) {
            return Err(RegistryError::PingTooEarly);
        }

        ping.verify(&node.pubkey_operator, new_sigs)?;

        if !sync.is_list_synced()
            && !node.is_pinged_within(EXPIRATION_SECONDS / 2, self.chain.adjusted_time())
        {
            sync.bump_asset_last_time("registry::ping_check_and_update");
        }

        node.last_ping = Some(ping.clone());
        let announce_hash = announce_from_node(node).hash();

        if let Some((_, seen)) = state.seen_announces.get_mut(&announce_hash) {
            seen.last_ping = ping.clone();
        }

        let ctx = self.check_context(state, sync, local.map(|l| l.operator.public_key()));
        let node = state.nodes.get_mut(&ping.outpoint).expect("still present");
        node.check(&ctx, true);

        // relay only for states where peers still care about liveness
        if !node.is_enabled() && !node.is_expired() && !node.is_sentinel_ping_expired() {
            return Ok(());
        }
        if sync.is_synced() {
            bus.relay_inv(Inv::new(InvKind::Ping, ping.hash(new_sigs).to_byte_array()));
        }
        Ok(())
    }

    /// Ask a peer for a single missing announce, rate-limited per
    /// (entry, peer).
    pub fn ask_for_node(&self, peer: &dyn Peer, outpoint: &OutPoint) {
        let squashed = peer.addr().squashed(self.params.network.allow_multiple_ports());
        let now = wall_time();
        {
            let mut state = self.state.lock();
            if let Some(asked) =
                state.we_asked_for_entry.get(outpoint).and_then(|peers| peers.get(&squashed))
            {
                if now < *asked {
                    // we asked recently, repeating too often could get us
                    // banned
                    return;
                }
            }
            state
                .we_asked_for_entry
                .entry(*outpoint)
                .or_default()
                .insert(squashed, now + DSEG_UPDATE_SECONDS);
        }
        tracing::debug!(target: "registry", peer = %peer.addr(),
            node = %outpoint.to_short_string(), "asking for missing service node entry");
        peer.send(Message::DsegRequest(*outpoint));
    }

    /// Ask a peer for the full registry, once per interval.
    pub fn request_full_list(&self, peer: &dyn Peer) {
        let squashed = peer.addr().squashed(self.params.network.allow_multiple_ports());
        let now = wall_time();
        {
            let mut state = self.state.lock();
            if self.params.network.is_mainnet()
                && !(peer.addr().is_rfc1918() || peer.addr().is_local())
            {
                if let Some(&asked) = state.we_asked_for_list.get(&squashed) {
                    if now < asked {
                        tracing::debug!(target: "registry", peer = %peer.addr(),
                            "already asked for the list, skipping");
                        return;
                    }
                }
            }
            state.we_asked_for_list.insert(squashed, now + DSEG_UPDATE_SECONDS);
        }
        peer.send(Message::DsegRequest(OutPoint::null()));
        tracing::debug!(target: "registry", peer = %peer.addr(), "asked for the full list");
    }

    // ---- list serving ---------------------------------------------------

    pub fn process_dseg_request(
        &self,
        peer: &dyn Peer,
        outpoint: OutPoint,
        sync: &SyncDriver,
    ) -> Result<(), RegistryError> {
        // serving the list is heavy; finish our own sync first
        if !sync.is_synced() {
            return Ok(());
        }
        if outpoint.is_null() {
            self.sync_all(peer)
        } else {
            self.sync_single(peer, &outpoint);
            Ok(())
        }
    }

    fn sync_single(&self, peer: &dyn Peer, outpoint: &OutPoint) {
        let new_sigs = self.sporks.is_new_sigs_active();
        let mut state = self.state.lock();
        let node = match state.nodes.get(outpoint) {
            Some(node) => node.clone(),
            None => return,
        };
        if node.addr.is_rfc1918() || node.addr.is_local() {
            return;
        }
        Self::push_node_invs(&mut state, peer, &node, new_sigs);
        tracing::debug!(target: "registry", peer = peer.id(), "sent one service node inv");
    }

    fn sync_all(&self, peer: &dyn Peer) -> Result<(), RegistryError> {
        let new_sigs = self.sporks.is_new_sigs_active();
        let squashed = peer.addr().squashed(self.params.network.allow_multiple_ports());
        let is_local = peer.addr().is_rfc1918() || peer.addr().is_local();
        let now = wall_time();

        let mut state = self.state.lock();
        if !is_local && self.params.network.is_mainnet() {
            if let Some(&until) = state.asked_us_for_list.get(&squashed) {
                if until > now {
                    tracing::warn!(target: "registry", peer = peer.id(),
                        "peer already asked for the list");
                    return Err(RegistryError::ListRequestAbuse);
                }
            }
            state.asked_us_for_list.insert(squashed, now + DSEG_UPDATE_SECONDS);
        }

        let mut count = 0i32;
        let nodes: Vec<ServiceNode> = state.nodes.values().cloned().collect();
        for node in &nodes {
            if node.addr.is_rfc1918() || node.addr.is_local() {
                continue;
            }
            // send regardless of state, peers need entries to verify old
            // votes
            Self::push_node_invs(&mut state, peer, node, new_sigs);
            count += 1;
        }

        peer.send(Message::SyncStatusCount { item_id: SYNC_LIST, count });
        tracing::debug!(target: "registry", peer = peer.id(), count, "sent service node invs");
        Ok(())
    }

    fn push_node_invs(
        state: &mut RegistryState,
        peer: &dyn Peer,
        node: &ServiceNode,
        new_sigs: bool,
    ) {
        let announce = announce_from_node(node);
        let announce_hash = announce.hash();
        let ping = announce.last_ping.clone();
        peer.push_inventory(Inv::new(InvKind::Announce, announce_hash.to_byte_array()));
        if !ping.is_null() {
            peer.push_inventory(Inv::new(InvKind::Ping, ping.hash(new_sigs).to_byte_array()));
            state.seen_pings.insert(ping.hash(new_sigs), ping);
        }
        state.seen_announces.entry(announce_hash).or_insert_with(|| (wall_time(), announce));
    }

    /// Serve a getdata for an announce or ping we advertised.
    pub fn serve_inv(&self, peer: &dyn Peer, inv: &Inv) {
        let state = self.state.lock();
        match inv.kind() {
            Some(InvKind::Announce) => {
                if let Some((_, announce)) =
                    state.seen_announces.get(&AnnounceHash::from_byte_array(inv.hash))
                {
                    peer.send(Message::Announce(announce.clone()));
                }
            }
            Some(InvKind::Ping) => {
                if let Some(ping) = state.seen_pings.get(&PingHash::from_byte_array(inv.hash)) {
                    peer.send(Message::Ping(ping.clone()));
                }
            }
            Some(InvKind::Verify) => {
                if let Some(verify) =
                    state.seen_verifications.get(&VerifyHash::from_byte_array(inv.hash))
                {
                    peer.send(Message::Verify(verify.clone()));
                }
            }
            _ => {}
        }
    }

    // ---- housekeeping ---------------------------------------------------

    /// Periodic housekeeping: spent collaterals, recovery quorums, cache
    /// expiry. Replies that reach quorum are reprocessed outside the lock.
    pub fn check_and_remove(
        &self,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) {
        if !sync.is_list_synced() {
            return;
        }

        self.check(sync, local);

        let mut reprocess: Vec<ServiceNodeAnnounce> = Vec::new();
        {
            let now = wall_time();
            let mut state = self.state.lock();
            let cached_height = state.cached_height;

            // collateral-spent detection is polled here, once per pass
            let spent: Vec<OutPoint> = state
                .nodes
                .keys()
                .filter(|outpoint| self.chain.utxo(outpoint).is_none())
                .copied()
                .collect();
            for outpoint in spent {
                if let Some(node) = state.nodes.get_mut(&outpoint) {
                    node.state = ServiceNodeState::OutpointSpent;
                    let hash = announce_from_node(node).hash();
                    let dirty = node.governance_vote_hashes();
                    tracing::debug!(target: "registry",
                        node = %outpoint.to_short_string(), "removing spent service node");
                    state.seen_announces.remove(&hash);
                    state.we_asked_for_entry.remove(&outpoint);
                    state.dirty_governance_hashes.extend(dirty);
                    state.nodes.remove(&outpoint);
                    state.nodes_removed = true;
                }
            }

            // ask the best-ranked peers to confirm nodes stuck in
            // NewStartRequired
            let mut ask_budget = RECOVERY_MAX_ASK_ENTRIES;
            let mut ranks: Option<Vec<(NetAddress, OutPoint)>> = None;
            let stuck: Vec<(OutPoint, AnnounceHash)> = state
                .nodes
                .values()
                .filter(|node| node.is_new_start_required())
                .map(|node| (node.outpoint, announce_from_node(node).hash()))
                .collect();
            for (outpoint, hash) in stuck {
                if ask_budget == 0
                    || !sync.is_synced()
                    || state.recovery_requests.contains_key(&hash)
                {
                    continue;
                }
                if ranks.is_none() {
                    let random_height = self.chain.rand_below(cached_height.max(1));
                    let block_hash = self.chain.block_hash(random_height);
                    ranks = Some(match block_hash {
                        Some(block_hash) => Self::scores(&state, &block_hash, 0)
                            .into_iter()
                            .map(|(_, node)| (node.addr, node.outpoint))
                            .collect(),
                        None => Vec::new(),
                    });
                }
                let mut requested: BTreeSet<NetAddress> = BTreeSet::new();
                for (addr, _) in ranks.as_ref().unwrap().iter() {
                    if requested.len() >= RECOVERY_QUORUM_TOTAL {
                        break;
                    }
                    // avoid banning: skip peers we already asked about it
                    let already = state
                        .we_asked_for_entry
                        .get(&outpoint)
                        .map(|peers| peers.contains_key(addr))
                        .unwrap_or(false);
                    if already {
                        continue;
                    }
                    requested.insert(*addr);
                    state.scheduled_recovery_connections.push((*addr, hash));
                }
                if !requested.is_empty() {
                    tracing::debug!(target: "registry",
                        node = %outpoint.to_short_string(), "recovery initiated");
                    ask_budget -= 1;
                }
                state.recovery_requests.insert(hash, (now + RECOVERY_WAIT_SECONDS, requested));
            }

            // quorum check on replies whose waiting window closed
            let due: Vec<AnnounceHash> = state
                .recovery_good_replies
                .keys()
                .filter(|hash| {
                    state
                        .recovery_requests
                        .get(*hash)
                        .map(|(expiry, _)| *expiry < now)
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            for hash in due {
                if let Some(replies) = state.recovery_good_replies.remove(&hash) {
                    if replies.len() >= RECOVERY_QUORUM_REQUIRED {
                        // the network agrees the node does not need a new
                        // announce, re-apply the newest good one
                        let mut reply = replies
                            .into_iter()
                            .max_by_key(|reply| reply.last_ping.sig_time)
                            .expect("non-empty");
                        reply.recovery = true;
                        reprocess.push(reply);
                    }
                }
            }

            state
                .recovery_requests
                .retain(|_, (expiry, _)| now - *expiry <= RECOVERY_RETRY_SECONDS);
            state.asked_us_for_list.retain(|_, &mut until| until >= now);
            state.we_asked_for_list.retain(|_, &mut until| until >= now);
            state.we_asked_for_entry.retain(|_, peers| {
                peers.retain(|_, &mut until| until >= now);
                !peers.is_empty()
            });
            state
                .we_asked_for_verification
                .retain(|_, verify| verify.block_height >= cached_height - MAX_POSE_BLOCKS);

            // NOTE: seen announces are cleaned on announce updates, not here
            state.seen_pings.retain(|_, ping| !ping.is_expired(now));
            state
                .seen_verifications
                .retain(|_, verify| verify.block_height >= cached_height - MAX_POSE_BLOCKS);

            tracing::info!(target: "registry", nodes = state.nodes.len(),
                asked_us = state.asked_us_for_list.len(),
                we_asked = state.we_asked_for_list.len(),
                entries_asked = state.we_asked_for_entry.len(),
                "registry housekeeping done");
        }

        for reply in reprocess {
            tracing::debug!(target: "registry",
                node = %reply.outpoint.to_short_string(), "reprocessing recovery announce");
            let _ = self.process_announce(None, reply, sync, local, bus);
        }

        self.fulfilled.check_and_remove();
    }

    // ---- scheduled connections -----------------------------------------

    /// Pop all scheduled recovery requests aimed at one address.
    fn pop_scheduled_recovery_connection(
        state: &mut RegistryState,
    ) -> Option<(NetAddress, BTreeSet<AnnounceHash>)> {
        state.scheduled_recovery_connections.sort();
        let (addr, _) = *state.scheduled_recovery_connections.first()?;
        let mut hashes = BTreeSet::new();
        state.scheduled_recovery_connections.retain(|(a, hash)| {
            if *a == addr {
                hashes.insert(*hash);
                false
            } else {
                true
            }
        });
        Some((addr, hashes))
    }

    /// Drive pending recovery connections: once the bus reports a live
    /// connection, ask for the scheduled announces via getdata.
    pub fn process_pending_recovery_requests(&self, bus: &dyn PeerBus) {
        let now = wall_time();
        let mut state = self.state.lock();

        if let Some((addr, hashes)) = Self::pop_scheduled_recovery_connection(&mut state) {
            if !bus.is_service_node_or_disconnect_requested(&addr) {
                state.pending_recovery.insert(addr, (now, hashes));
                bus.add_pending_service_node(addr);
            }
        }

        let pending: Vec<(NetAddress, (i64, BTreeSet<AnnounceHash>))> =
            state.pending_recovery.iter().map(|(a, e)| (*a, e.clone())).collect();
        for (addr, (added, hashes)) in pending {
            let done = match bus.find_peer(&addr) {
                Some(peer) => {
                    let to_fetch: Vec<Inv> = hashes
                        .iter()
                        .map(|hash| Inv::new(InvKind::Announce, hash.to_byte_array()))
                        .collect();
                    if !to_fetch.is_empty() {
                        peer.send(Message::GetData(to_fetch));
                    }
                    true
                }
                None => false,
            };
            if done || now - added > PENDING_CONNECT_SECONDS {
                if !done {
                    tracing::debug!(target: "registry", %addr,
                        "failed to connect for announce recovery");
                }
                state.pending_recovery.remove(&addr);
            }
        }
    }

    // ---- proof-of-service verification ---------------------------------

    /// One verification round: when we rank high enough, challenge a
    /// stripe of lower-ranked nodes over direct connections.
    pub fn do_full_verification_step(
        &self,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) {
        let local = match local {
            Some(local) if !local.outpoint.is_null() => local,
            _ => return,
        };
        if !sync.is_synced() {
            return;
        }

        let tip = self.cached_height();
        let ranks = match self.get_ranks(tip - 1, MIN_POSE_PROTO_VERSION, sync) {
            Some(ranks) => ranks,
            None => return,
        };

        let mut my_rank = None;
        for (rank, info) in &ranks {
            if *rank > MAX_POSE_RANK {
                // only the top of the ranking sends challenges
                return;
            }
            if info.outpoint == local.outpoint {
                my_rank = Some(*rank);
                break;
            }
        }
        let my_rank = match my_rank {
            Some(rank) => rank,
            None => return,
        };
        tracing::debug!(target: "registry", rank = my_rank, total = ranks.len(),
            "verification round, challenging from our stripe");

        let now = wall_time();
        let mut offset = MAX_POSE_RANK + my_rank - 1;
        let mut sent = 0usize;
        while offset < ranks.len() {
            let (_, info) = &ranks[offset];
            let (verified, banned) = {
                let state = self.state.lock();
                match state.nodes.get(&info.outpoint) {
                    Some(node) => (node.is_pose_verified(), node.is_pose_banned()),
                    None => (false, true),
                }
            };
            if verified || banned {
                offset += MAX_POSE_CONNECTIONS;
                continue;
            }
            tracing::debug!(target: "registry",
                node = %info.outpoint.to_short_string(), addr = %info.addr,
                "requesting verification");
            if self.send_verify_request(&info.addr, tip - 1, now, bus) {
                sent += 1;
                if sent >= MAX_POSE_CONNECTIONS {
                    break;
                }
            }
            offset += MAX_POSE_CONNECTIONS;
        }
        tracing::debug!(target: "registry", sent, "verification requests scheduled");
    }

    fn send_verify_request(
        &self,
        addr: &NetAddress,
        block_height: i32,
        now: i64,
        bus: &dyn PeerBus,
    ) -> bool {
        if self.fulfilled.has(addr, request::VERIFY_REQUEST) {
            // asking the same node too often is a good way to get banned
            return false;
        }
        if bus.is_service_node_or_disconnect_requested(addr) {
            return false;
        }
        bus.add_pending_service_node(*addr);
        let nonce = self.chain.rand_below(VERIFY_NONCE_RANGE).max(1);
        let verify = ServiceNodeVerification::challenge(*addr, nonce, block_height);
        let mut state = self.state.lock();
        state.pending_verifications.insert(*addr, (now, verify));
        true
    }

    /// Flush scheduled challenges over connections that came up, expire
    /// the rest.
    pub fn process_pending_verify_requests(&self, bus: &dyn PeerBus) {
        let now = wall_time();
        let mut state = self.state.lock();
        let pending: Vec<(NetAddress, (i64, ServiceNodeVerification))> =
            state.pending_verifications.iter().map(|(a, e)| (*a, e.clone())).collect();
        for (addr, (added, verify)) in pending {
            let done = match bus.find_peer(&addr) {
                Some(peer) => {
                    self.fulfilled.add(addr, request::VERIFY_REQUEST);
                    state.we_asked_for_verification.insert(addr, verify.clone());
                    tracing::debug!(target: "registry", %addr, nonce = verify.nonce,
                        "verifying node");
                    peer.send(Message::Verify(verify));
                    true
                }
                None => false,
            };
            if done || now - added > PENDING_CONNECT_SECONDS {
                if !done {
                    tracing::debug!(target: "registry", %addr,
                        "failed to connect for verification");
                }
                state.pending_verifications.remove(&addr);
            }
        }
    }

    pub fn process_verify(
        &self,
        peer: &dyn Peer,
        verify: ServiceNodeVerification,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) -> Result<(), RegistryError> {
        peer.clear_ask_for(&verify.hash().to_byte_array());
        if !sync.is_list_synced() {
            return Ok(());
        }
        if verify.is_challenge() {
            // someone asked us to prove we own the address we advertise
            self.send_verify_reply(peer, verify, local)
        } else if verify.is_reply() {
            self.process_verify_reply(peer, verify, local, bus)
        } else {
            self.process_verify_broadcast(peer, verify, sync, bus)
        }
    }

    fn send_verify_reply(
        &self,
        peer: &dyn Peer,
        mut verify: ServiceNodeVerification,
        local: Option<&LocalIdentity>,
    ) -> Result<(), RegistryError> {
        let local = match local {
            // not a service node: do not ban, a malicious node might be
            // using our address to confuse the initiator
            Some(local) => local,
            None => return Ok(()),
        };
        if self.fulfilled.has(&peer.addr(), request::VERIFY_REPLY) {
            tracing::warn!(target: "registry", peer = peer.id(),
                "peer is asking to verify us too often");
            return Err(RegistryError::VerifyRateLimited);
        }
        let block_hash = match self.chain.block_hash(verify.block_height) {
            Some(hash) => hash,
            None => {
                tracing::debug!(target: "registry", height = verify.block_height,
                    "no block hash for verify reply");
                return Ok(());
            }
        };

        verify.sign_reply(&local.operator, &block_hash, self.sporks.is_new_sigs_active());
        peer.send(Message::Verify(verify));
        self.fulfilled.add(peer.addr(), request::VERIFY_REPLY);
        Ok(())
    }

    fn process_verify_reply(
        &self,
        peer: &dyn Peer,
        mut verify: ServiceNodeVerification,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) -> Result<(), RegistryError> {
        let peer_addr = peer.addr();
        let new_sigs = self.sporks.is_new_sigs_active();

        // did we even ask for it?
        if !self.fulfilled.has(&peer_addr, request::VERIFY_REQUEST) {
            return Err(RegistryError::UnexpectedVerifyReply);
        }
        {
            let state = self.state.lock();
            let asked = state
                .we_asked_for_verification
                .get(&peer_addr)
                .ok_or(RegistryError::UnexpectedVerifyReply)?;
            if asked.nonce != verify.nonce {
                return Err(RegistryError::WrongVerifyNonce);
            }
            if asked.block_height != verify.block_height {
                return Err(RegistryError::WrongVerifyHeight);
            }
        }
        let block_hash = match self.chain.block_hash(verify.block_height) {
            Some(hash) => hash,
            None => return Ok(()),
        };
        if self.fulfilled.has(&peer_addr, request::VERIFY_DONE) {
            return Err(RegistryError::AlreadyVerified);
        }

        let mut relay_hash = None;
        {
            let mut state = self.state.lock();
            let same_addr: Vec<OutPoint> = state
                .nodes
                .values()
                .filter(|node| node.addr == peer_addr)
                .map(|node| node.outpoint)
                .collect();

            let mut real: Option<OutPoint> = None;
            let mut fakes: Vec<OutPoint> = Vec::new();
            for outpoint in same_addr {
                let node = state.nodes.get(&outpoint).expect("collected above");
                if verify.verify_reply(&node.pubkey_operator, &block_hash, new_sigs).is_ok() {
                    real = Some(outpoint);
                } else {
                    fakes.push(outpoint);
                }
            }

            let real = match real {
                Some(real) => real,
                None => {
                    // nobody home behind that address; someone is gaming
                    // the system
                    tracing::warn!(target: "registry", addr = %peer_addr,
                        "no real service node found for verified address");
                    return Err(RegistryError::NoRealNode);
                }
            };

            if let Some(node) = state.nodes.get_mut(&real) {
                if !node.is_pose_verified() {
                    node.decrease_pose_ban_score();
                }
            }
            self.fulfilled.add(peer_addr, request::VERIFY_DONE);
            tracing::info!(target: "registry", node = %real.to_short_string(),
                addr = %peer_addr, "verified real service node");

            // we can only broadcast the result as an activated node
            if let Some(local) = local {
                if !local.outpoint.is_null() {
                    let node_addr = state.nodes.get(&real).expect("present").addr;
                    verify.addr = node_addr;
                    verify.outpoint1 = real;
                    verify.outpoint2 = local.outpoint;
                    verify.sign_broadcast(&local.operator, &block_hash, new_sigs);
                    state.we_asked_for_verification.insert(peer_addr, verify.clone());
                    let hash = verify.hash();
                    state.seen_verifications.insert(hash, verify.clone());
                    relay_hash = Some(hash);
                }
            }

            for outpoint in &fakes {
                if let Some(node) = state.nodes.get_mut(outpoint) {
                    node.increase_pose_ban_score();
                    tracing::debug!(target: "registry",
                        node = %outpoint.to_short_string(), score = node.pose_ban_score,
                        "increased ban score for impostor");
                }
            }
            if !fakes.is_empty() {
                tracing::warn!(target: "registry", count = fakes.len(), addr = %peer_addr,
                    "ban score increased for fake service nodes");
            }
        }

        if let Some(hash) = relay_hash {
            bus.relay_inv(Inv::new(InvKind::Verify, hash.to_byte_array()));
        }
        Ok(())
    }

    fn process_verify_broadcast(
        &self,
        peer: &dyn Peer,
        verify: ServiceNodeVerification,
        sync: &SyncDriver,
        bus: &dyn PeerBus,
    ) -> Result<(), RegistryError> {
        let new_sigs = self.sporks.is_new_sigs_active();
        let hash = verify.hash();

        {
            let mut state = self.state.lock();
            if state.seen_verifications.contains_key(&hash) {
                return Ok(());
            }
            state.seen_verifications.insert(hash, verify.clone());

            // we don't care about history
            if verify.block_height < state.cached_height - MAX_POSE_BLOCKS {
                tracing::debug!(target: "registry", current = state.cached_height,
                    height = verify.block_height, peer = peer.id(), "outdated verification");
                return Ok(());
            }
        }

        if verify.outpoint1 == verify.outpoint2 {
            // cheating by verifying oneself was not a good idea
            return Err(RegistryError::SelfVerification);
        }

        let block_hash = match self.chain.block_hash(verify.block_height) {
            Some(hash) => hash,
            None => return Ok(()),
        };

        let rank =
            match self.get_rank(&verify.outpoint2, verify.block_height, MIN_POSE_PROTO_VERSION, sync)
            {
                Some(rank) => rank,
                None => {
                    tracing::debug!(target: "registry",
                        node = %verify.outpoint2.to_short_string(),
                        "cannot calculate rank for verifier");
                    return Ok(());
                }
            };
        if rank > MAX_POSE_RANK {
            tracing::debug!(target: "registry", rank,
                node = %verify.outpoint2.to_short_string(),
                "verifier is not in the top ranks");
            return Err(RegistryError::VerifyRankTooLow);
        }

        let mut state = self.state.lock();

        let (pubkey1, addr1) = match state.nodes.get(&verify.outpoint1) {
            Some(node) => (node.pubkey_operator.clone(), node.addr),
            None => {
                tracing::warn!(target: "registry",
                    node = %verify.outpoint1.to_short_string(), "unknown verified node");
                return Ok(());
            }
        };
        let pubkey2 = match state.nodes.get(&verify.outpoint2) {
            Some(node) => node.pubkey_operator.clone(),
            None => {
                tracing::warn!(target: "registry",
                    node = %verify.outpoint2.to_short_string(), "unknown verifying node");
                return Ok(());
            }
        };
        if addr1 != verify.addr {
            tracing::warn!(target: "registry", %addr1, addr = %verify.addr,
                "verification address mismatch");
            return Ok(());
        }

        verify.verify_broadcast(&pubkey1, &pubkey2, &block_hash, new_sigs)?;

        if let Some(node) = state.nodes.get_mut(&verify.outpoint1) {
            if !node.is_pose_verified() {
                node.decrease_pose_ban_score();
            }
        }
        tracing::info!(target: "registry", node = %verify.outpoint1.to_short_string(),
            addr = %verify.addr, "verified service node from broadcast");

        let mut count = 0;
        for node in state.nodes.values_mut() {
            if node.addr != verify.addr || node.outpoint == verify.outpoint1 {
                continue;
            }
            node.increase_pose_ban_score();
            count += 1;
        }
        if count > 0 {
            tracing::warn!(target: "registry", count, addr = %verify.addr,
                "ban score increased for same-address service nodes");
        }
        drop(state);
        bus.relay_inv(Inv::new(InvKind::Verify, hash.to_byte_array()));
        Ok(())
    }

    /// Sweep for address duplicates: within a run of equal addresses a
    /// verified node bans the others; with nobody verified nothing
    /// happens.
    pub fn check_same_addr(&self, sync: &SyncDriver) {
        if !sync.is_synced() {
            return;
        }
        let mut state = self.state.lock();
        if state.nodes.is_empty() {
            return;
        }

        let mut by_addr: Vec<(NetAddress, OutPoint, bool)> = state
            .nodes
            .values()
            .filter(|node| node.is_enabled() || node.is_pre_enabled())
            .map(|node| (node.addr, node.outpoint, node.is_pose_verified()))
            .collect();
        by_addr.sort();

        let mut to_ban: Vec<OutPoint> = Vec::new();
        let mut prev: Option<(NetAddress, OutPoint)> = None;
        let mut verified_in_run: Option<OutPoint> = None;
        for (addr, outpoint, verified) in by_addr {
            match prev {
                Some((prev_addr, prev_outpoint)) if prev_addr == addr => {
                    if verified_in_run.is_some() {
                        to_ban.push(outpoint);
                    } else if verified {
                        // this one proves the address, ban the one before
                        to_ban.push(prev_outpoint);
                        verified_in_run = Some(outpoint);
                    }
                }
                _ => {
                    verified_in_run = if verified { Some(outpoint) } else { None };
                }
            }
            prev = Some((addr, outpoint));
        }

        for outpoint in to_ban {
            if let Some(node) = state.nodes.get_mut(&outpoint) {
                node.increase_pose_ban_score();
                tracing::info!(target: "registry", node = %outpoint.to_short_string(),
                    "increasing ban score for address duplicate");
            }
        }
    }

    // ---- last paid ------------------------------------------------------

    /// Back-scan recent coinbases to refresh every node's last-paid data.
    pub fn update_last_paid(&self, ledger: &PaymentLedger, sync: &SyncDriver) {
        if !sync.is_winners_list_synced() {
            return;
        }
        let mut state = self.state.lock();
        if state.nodes.is_empty() {
            return;
        }
        let cached_height = state.cached_height;
        let max_scan = (params::LAST_PAID_SCAN_BLOCKS
            .max(cached_height - state.last_paid_run_height))
        .min(ledger.storage_limit(state.nodes.len()));

        for node in state.nodes.values_mut() {
            node.update_last_paid(
                &*self.chain,
                max_scan,
                |height| {
                    self.params.service_node_payment(height, self.chain.block_subsidy(height))
                },
                |height, payee| ledger.block_has_payee_with_votes(height, payee, 2),
            );
        }
        state.last_paid_run_height = cached_height;
    }

    /// Warn once when at least half the registry reports a newer daemon.
    pub fn warn_daemon_updates(&self, sync: &SyncDriver) -> Option<String> {
        if !sync.is_list_synced() {
            return None;
        }
        let mut state = self.state.lock();
        if state.warned_daemon_updates || state.nodes.is_empty() {
            return None;
        }
        let total = state.nodes.len();
        let updated = state
            .nodes
            .values()
            .filter(|node| {
                node.last_ping
                    .as_ref()
                    .map(|ping| ping.daemon_version > params::CLIENT_VERSION)
                    .unwrap_or(false)
            })
            .count();
        if updated < total / 2 {
            return None;
        }
        state.warned_daemon_updates = true;
        Some(if updated != total {
            format!(
                "Warning: At least {} of {} service nodes are running on a newer software version. \
                 Please check latest releases, you might need to update too.",
                updated, total
            )
        } else {
            format!(
                "Warning: Every service node (out of {} known ones) is running on a newer software \
                 version. Please check latest releases, it's very likely that you missed a \
                 major/critical update.",
                total
            )
        })
    }

    /// New chain tip: refresh the cached height and run the tip-driven
    /// sweeps.
    pub fn updated_block_tip(
        &self,
        height: i32,
        sync: &SyncDriver,
        ledger: &PaymentLedger,
        service_node_mode: bool,
    ) {
        self.state.lock().cached_height = height;
        tracing::debug!(target: "registry", height, "updated block tip");
        self.check_same_addr(sync);
        if service_node_mode {
            // a normal wallet refreshes this on demand instead
            self.update_last_paid(ledger, sync);
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = RegistryState { cached_height: state.cached_height, ..Default::default() };
    }

    // ---- snapshot plumbing ---------------------------------------------

    pub(crate) fn export_snapshot(&self) -> crate::snapshot::RegistrySnapshot {
        let state = self.state.lock();
        crate::snapshot::RegistrySnapshot {
            nodes: state.nodes.clone(),
            asked_us_for_list: state.asked_us_for_list.clone(),
            we_asked_for_list: state.we_asked_for_list.clone(),
            we_asked_for_entry: state.we_asked_for_entry.clone(),
            recovery_requests: state.recovery_requests.clone(),
            recovery_good_replies: state.recovery_good_replies.clone(),
            last_sentinel_ping_time: state.last_sentinel_ping_time,
            dsq_count: state.dsq_count,
            seen_announces: state.seen_announces.clone(),
            seen_pings: state.seen_pings.clone(),
        }
    }

    pub(crate) fn apply_snapshot(&self, snapshot: crate::snapshot::RegistrySnapshot) {
        let mut state = self.state.lock();
        state.nodes = snapshot.nodes;
        state.asked_us_for_list = snapshot.asked_us_for_list;
        state.we_asked_for_list = snapshot.we_asked_for_list;
        state.we_asked_for_entry = snapshot.we_asked_for_entry;
        state.recovery_requests = snapshot.recovery_requests;
        state.recovery_good_replies = snapshot.recovery_good_replies;
        state.last_sentinel_ping_time = snapshot.last_sentinel_ping_time;
        state.dsq_count = snapshot.dsq_count;
        state.seen_announces = snapshot.seen_announces;
        state.seen_pings = snapshot.seen_pings;
    }
}

/// Rebuild the gossip announce for a stored node; used for seen-map keys
/// and list serving.
pub fn announce_from_node(node: &ServiceNode) -> ServiceNodeAnnounce {
    ServiceNodeAnnounce {
        outpoint: node.outpoint,
        addr: node.addr,
        pubkey_collateral: node.pubkey_collateral.clone(),
        pubkey_operator: node.pubkey_operator.clone(),
        sig: node.sig.clone(),
        sig_time: node.sig_time,
        protocol_version: node.protocol_version,
        last_ping: node.last_ping.clone().unwrap_or_default(),
        recovery: false,
        initial_state: node.state,
    }
}

fn node_from_announce(
    announce: &ServiceNodeAnnounce,
    collateral_min_conf_block_hash: BlockHash,
) -> ServiceNode {
    ServiceNode {
        outpoint: announce.outpoint,
        addr: announce.addr,
        pubkey_collateral: announce.pubkey_collateral.clone(),
        pubkey_operator: announce.pubkey_operator.clone(),
        last_ping: if announce.last_ping.is_null() {
            None
        } else {
            Some(announce.last_ping.clone())
        },
        sig: announce.sig.clone(),
        sig_time: announce.sig_time,
        last_dsq: 0,
        time_last_checked: 0,
        time_last_paid: 0,
        state: announce.initial_state,
        collateral_min_conf_block_hash,
        block_last_paid: 0,
        protocol_version: announce.protocol_version,
        pose_ban_score: 0,
        pose_ban_height: 0,
        allow_mixing: true,
        governance_votes: BTreeMap::new(),
    }
}
