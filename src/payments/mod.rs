//! The payment ledger: who gets paid for which block, backed by a
//! vote-weighted election over a sliding window of heights.
//!
//! Two locks, blocks before votes when both are held; both nest inside
//! the registry lock, never around it.

pub mod vote;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bitcoin_hashes::Hash;
use parking_lot::Mutex;

use crate::cache::{request, FulfilledRequestCache};
use crate::chain::ChainAdapter;
use crate::error::PaymentError;
use crate::hash_types::VoteHash;
use crate::net::{Inv, InvKind, Message, Peer, PeerBus};
use crate::params::{
    NetworkParams, SporkSet, MAX_INV_SIZE, MIN_PAYMENT_PROTO_VERSION_1, PAYMENT_VOTES_REQUIRED,
    PAYMENT_VOTES_TOTAL,
};
use crate::primitives::{OutPoint, ScriptBuf, TxOut};
use crate::registry::{LocalIdentity, ServiceNodeRegistry};
use crate::sync::{SyncDriver, SYNC_VOTES};

pub use vote::{BlockPayees, Payee, PaymentVote};

/// Window of future heights advertised in a payment sync.
const SYNC_LOOKAHEAD: i32 = 20;

/// How many blocks past the tip a vote may target.
const VOTE_FUTURE_LIMIT: i32 = 20;

/// Blocks ahead of the tip we originate votes for.
const VOTE_LEAD: i32 = 10;

/// Votes per registry entry retained, times the registry size.
const STORAGE_COEFF_NUM: i64 = 125;
const STORAGE_COEFF_DEN: i64 = 100;
/// Floor of the storage window, in blocks.
const MIN_BLOCKS_TO_STORE: i32 = 6000;

/// Governance-side checks for superblocks; supplied by the surrounding
/// node, a no-op by default.
pub trait SuperblockOracle: Send + Sync {
    fn is_valid_block_height(&self, height: i32) -> bool;
    fn is_triggered(&self, height: i32) -> bool;
    fn is_valid(&self, outputs: &[TxOut], height: i32, expected_reward: i64, actual_reward: i64)
        -> bool;
    fn payments_limit(&self, height: i32) -> i64;
}

/// The default oracle: no superblocks ever trigger.
pub struct NoSuperblocks;

impl SuperblockOracle for NoSuperblocks {
    fn is_valid_block_height(&self, _height: i32) -> bool {
        false
    }
    fn is_triggered(&self, _height: i32) -> bool {
        false
    }
    fn is_valid(&self, _: &[TxOut], _: i32, _: i64, _: i64) -> bool {
        false
    }
    fn payments_limit(&self, _height: i32) -> i64 {
        0
    }
}

#[derive(Default)]
struct VotesState {
    votes: BTreeMap<VoteHash, PaymentVote>,
    /// One vote per voter per height; re-votes overwrite.
    last_votes: BTreeMap<OutPoint, i32>,
    /// How often each expected voter failed to show up.
    did_not_vote: BTreeMap<OutPoint, i64>,
}

/// Accumulates payee votes per block and answers "is this coinbase paying
/// the right node".
pub struct PaymentLedger {
    chain: Arc<dyn ChainAdapter>,
    params: NetworkParams,
    sporks: Arc<SporkSet>,
    fulfilled: Arc<FulfilledRequestCache>,
    oracle: Arc<dyn SuperblockOracle>,
    cached_height: AtomicI32,
    blocks: Mutex<BTreeMap<i32, BlockPayees>>,
    votes: Mutex<VotesState>,
}

impl PaymentLedger {
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        params: NetworkParams,
        sporks: Arc<SporkSet>,
        fulfilled: Arc<FulfilledRequestCache>,
        oracle: Arc<dyn SuperblockOracle>,
    ) -> Self {
        PaymentLedger {
            chain,
            params,
            sporks,
            fulfilled,
            oracle,
            cached_height: AtomicI32::new(0),
            blocks: Mutex::new(BTreeMap::new()),
            votes: Mutex::new(VotesState::default()),
        }
    }

    pub fn cached_height(&self) -> i32 {
        self.cached_height.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn vote_count(&self) -> usize {
        self.votes.lock().votes.len()
    }

    /// Retention window: grows with the registry, floored at
    /// `MIN_BLOCKS_TO_STORE`.
    pub fn storage_limit(&self, registry_size: usize) -> i32 {
        ((registry_size as i64 * STORAGE_COEFF_NUM / STORAGE_COEFF_DEN) as i32)
            .max(MIN_BLOCKS_TO_STORE)
    }

    pub fn min_payment_proto(&self) -> u32 {
        self.sporks.min_payment_proto()
    }

    pub fn clear(&self) {
        let mut blocks = self.blocks.lock();
        let mut votes = self.votes.lock();
        blocks.clear();
        *votes = VotesState::default();
    }

    /// Record that a voter voted for a height; rejects duplicates for the
    /// same height, otherwise moves the marker.
    pub fn update_last_vote(&self, vote: &PaymentVote) -> bool {
        let mut votes = self.votes.lock();
        match votes.last_votes.get_mut(&vote.voter_outpoint) {
            Some(height) => {
                if *height == vote.block_height {
                    return false;
                }
                *height = vote.block_height;
                true
            }
            None => {
                votes.last_votes.insert(vote.voter_outpoint, vote.block_height);
                true
            }
        }
    }

    pub fn has_verified_payment_vote(&self, hash: &VoteHash) -> bool {
        self.votes.lock().votes.get(hash).map(|vote| vote.is_verified()).unwrap_or(false)
    }

    /// Store a vote in the vote map and the per-height tally. The
    /// `height - 101` block hash is the anti-replay anchor: without it the
    /// vote is undateable and dropped.
    pub fn add_or_update_payment_vote(&self, vote: &PaymentVote) -> bool {
        if self.chain.block_hash(vote.block_height - 101).is_none() {
            return false;
        }
        let hash = vote.hash();
        if self.has_verified_payment_vote(&hash) {
            return false;
        }

        let mut blocks = self.blocks.lock();
        let mut votes = self.votes.lock();
        votes.votes.insert(hash, vote.clone());
        blocks
            .entry(vote.block_height)
            .or_insert_with(|| BlockPayees::new(vote.block_height))
            .add_payee(vote);
        tracing::debug!(target: "payments", hash = %hash, "payment vote added");
        true
    }

    pub fn get_block_payee(&self, height: i32) -> Option<ScriptBuf> {
        self.blocks.lock().get(&height).and_then(|payees| payees.best_payee().cloned())
    }

    /// Human-readable payee tally for a height, for RPC-style listings.
    pub fn required_payments_string(&self, height: i32) -> String {
        self.blocks
            .lock()
            .get(&height)
            .map(|payees| payees.required_payments_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Is this payee already lined up in the near future? Looks eight
    /// blocks ahead so vote propagation can finish before re-election.
    pub fn is_scheduled(&self, payee: &ScriptBuf, not_height: i32, list_synced: bool) -> bool {
        if !list_synced {
            return false;
        }
        let cached = self.cached_height();
        let blocks = self.blocks.lock();
        for height in cached..=cached + 8 {
            if height == not_height {
                continue;
            }
            if let Some(best) = blocks.get(&height).and_then(|payees| payees.best_payee()) {
                if best == payee {
                    return true;
                }
            }
        }
        false
    }

    pub fn block_has_payee_with_votes(
        &self,
        height: i32,
        payee: &ScriptBuf,
        required: usize,
    ) -> bool {
        self.blocks
            .lock()
            .get(&height)
            .map(|payees| payees.has_payee_with_votes(payee, required))
            .unwrap_or(false)
    }

    /// Expected service-node payment for a block.
    pub fn payment_amount(&self, height: i32) -> i64 {
        self.params.service_node_payment(height, self.chain.block_subsidy(height))
    }

    /// Validate a coinbase against the tally for its height.
    pub fn is_transaction_valid(&self, outputs: &[TxOut], height: i32) -> bool {
        let expected = self.payment_amount(height);
        let blocks = self.blocks.lock();
        match blocks.get(&height) {
            Some(payees) => payees.is_transaction_valid(outputs, expected),
            None => true,
        }
    }

    /// Block-value bound check, budget- and superblock-aware.
    pub fn is_block_value_valid(
        &self,
        outputs: &[TxOut],
        height: i32,
        expected_reward: i64,
        actual_reward: i64,
        synced: bool,
    ) -> Result<(), String> {
        let reward_ok = actual_reward <= expected_reward;
        let reward_err = |reason: &str| {
            Err(format!(
                "coinbase pays too much at height {} (actual={} vs limit={}), exceeded block \
                 reward, {}",
                height, actual_reward, expected_reward, reason
            ))
        };

        if height < self.params.superblock_start_block {
            if self.params.is_budget_window(height) {
                // old budget system is long gone; only its window shape
                // remains
                if synced {
                    if reward_ok {
                        return Ok(());
                    }
                    return reward_err("old budgets are disabled");
                }
                // when not synced, rely on online nodes
                return Ok(());
            }
            if reward_ok {
                return Ok(());
            }
            return reward_err("block is not in old budget cycle window");
        }

        // superblocks started
        let superblock_max = expected_reward + self.oracle.payments_limit(height);
        if !synced {
            // not enough data, enforce the loosest applicable bound
            if self.oracle.is_valid_block_height(height) {
                if actual_reward <= superblock_max {
                    return Ok(());
                }
                return Err(format!(
                    "coinbase pays too much at height {} (actual={} vs limit={}), exceeded \
                     superblock max value",
                    height, actual_reward, superblock_max
                ));
            }
            if reward_ok {
                return Ok(());
            }
            return reward_err("only regular blocks are allowed at this height");
        }

        if self.sporks.are_superblocks_enabled() {
            if self.oracle.is_triggered(height) {
                if self.oracle.is_valid(outputs, height, actual_reward, expected_reward) {
                    return Ok(());
                }
                // triggered but invalid? that's weird
                return Err(format!("invalid superblock detected at height {}", height));
            }
            if reward_ok {
                return Ok(());
            }
            return reward_err("no triggered superblock detected");
        }
        if reward_ok {
            return Ok(());
        }
        reward_err("superblocks are disabled")
    }

    /// Payee-level block check: superblock delegation first, then the
    /// vote quorum, then the enforcement spork as a last resort.
    pub fn is_block_payee_valid(
        &self,
        outputs: &[TxOut],
        height: i32,
        expected_reward: i64,
        actual_reward: i64,
        synced: bool,
    ) -> bool {
        if !synced {
            // no data to check anything against, follow the longest chain
            return true;
        }

        if height < self.params.superblock_start_block {
            // blocks below the superblock era carry enough confirmations
            // to be accepted without payee verification
            return true;
        }

        if self.sporks.are_superblocks_enabled() && self.oracle.is_triggered(height) {
            return self.oracle.is_valid(outputs, height, expected_reward, actual_reward);
        }

        if self.is_transaction_valid(outputs, height) {
            return true;
        }

        if self.sporks.is_payment_enforcement_active() {
            tracing::warn!(target: "payments", height, "invalid service-node payment detected");
            return false;
        }
        tracing::warn!(target: "payments",
            "payment enforcement is disabled, accepting any payee");
        true
    }

    /// Append the service-node output to a coinbase under assembly.
    pub fn fill_block_payee(
        &self,
        outputs: &mut Vec<TxOut>,
        height: i32,
        block_reward: i64,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
    ) -> Option<TxOut> {
        let payee = match self.get_block_payee(height) {
            Some(payee) => payee,
            None => {
                // no winner on record, fall back to our own election
                let (_, info) = registry.next_payee(height, true, self, sync);
                match info {
                    Some(info) => info.payee_script(),
                    None => {
                        tracing::warn!(target: "payments", height,
                            "failed to detect a service node to pay");
                        return None;
                    }
                }
            }
        };

        let payment = self.params.service_node_payment(height, block_reward);
        let txout = TxOut { value: payment, script_pubkey: payee };
        outputs.push(txout.clone());
        tracing::info!(target: "payments", amount = payment,
            payee = %txout.script_pubkey.to_asm_string(), "service node payment filled");
        Some(txout)
    }

    /// Fund the service-node output by decrementing its neighbor. The
    /// caller's coinbase must keep the service-node payment as the last
    /// output, with the adjustable output directly before it.
    pub fn adjust_service_node_payment(outputs: &mut [TxOut], payment_out: &TxOut) {
        if !outputs.iter().any(|out| out == payment_out) {
            return;
        }
        let amount = payment_out.value;
        let len = outputs.len();
        if len >= 2 {
            outputs[len - 2].value -= amount;
        }
    }

    // ---- vote origination ----------------------------------------------

    /// Vote for the payee of `block_height` if we are one of the elected
    /// voters for it.
    pub fn process_block(
        &self,
        block_height: i32,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) -> bool {
        let local = match local {
            Some(local) => local,
            None => return false,
        };
        // with the list out of sync we have little chance to pick the
        // right winner, but without it there is no point trying at all
        if !sync.is_list_synced() {
            return false;
        }

        let min_proto = self.sporks.min_payment_proto();
        let rank = match registry.get_rank(&local.outpoint, block_height - 101, min_proto, sync) {
            Some(rank) => rank,
            None => {
                tracing::debug!(target: "payments", "unknown service node, not voting");
                return false;
            }
        };
        if rank > PAYMENT_VOTES_TOTAL {
            tracing::debug!(target: "payments", rank, "not in the voting quorum");
            return false;
        }

        // pay the oldest node that is due and has been around long enough
        let (_, info) = registry.next_payee(block_height, true, self, sync);
        let info = match info {
            Some(info) => info,
            None => {
                tracing::warn!(target: "payments", "failed to find a service node to pay");
                return false;
            }
        };
        tracing::info!(target: "payments", height = block_height,
            payee = %info.outpoint.to_short_string(), "voting for next payee");

        let mut vote = PaymentVote::new(local.outpoint, block_height, info.payee_script());
        vote.sign(&local.operator, self.sporks.is_new_sigs_active());

        if self.add_or_update_payment_vote(&vote) {
            bus.relay_inv(Inv::new(InvKind::PaymentVote, vote.hash().to_byte_array()));
            return true;
        }
        false
    }

    /// Record which of the expected voters for a height never showed up.
    pub fn check_block_votes(
        &self,
        block_height: i32,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
    ) {
        if !sync.is_winners_list_synced() {
            return;
        }
        let min_proto = self.sporks.min_payment_proto();
        let ranks = match registry.get_ranks(block_height - 101, min_proto, sync) {
            Some(ranks) => ranks,
            None => return,
        };

        let blocks = self.blocks.lock();
        let mut votes = self.votes.lock();
        let block = blocks.get(&block_height);
        for (rank, info) in ranks.iter().take(PAYMENT_VOTES_TOTAL) {
            let voted = block
                .map(|payees| {
                    payees.payees.iter().any(|payee| {
                        payee.vote_hashes().iter().any(|hash| {
                            votes
                                .votes
                                .get(hash)
                                .map(|vote| vote.voter_outpoint == info.outpoint)
                                .unwrap_or(false)
                        })
                    })
                })
                .unwrap_or(false);
            if !voted {
                *votes.did_not_vote.entry(info.outpoint).or_insert(0) += 1;
                tracing::debug!(target: "payments", rank,
                    node = %info.outpoint.to_short_string(), height = block_height,
                    "no vote received from expected voter");
            }
        }
    }

    // ---- message handling ----------------------------------------------

    /// Serve a full payment-vote sync to a peer.
    pub fn process_payment_sync(
        &self,
        peer: &dyn Peer,
        sync: &SyncDriver,
    ) -> Result<(), PaymentError> {
        if peer.version() < self.sporks.min_payment_proto() {
            tracing::debug!(target: "payments", peer = peer.id(), version = peer.version(),
                "payment sync from obsolete peer");
            peer.send(Message::Reject {
                message: "fnpaymentsync".to_string(),
                code: 0x11,
                reason: format!("Version must be {} or greater", self.sporks.min_payment_proto()),
            });
            return Err(PaymentError::ObsoleteVersion);
        }
        // serving the votes is heavy; finish our own sync first
        if !sync.is_synced() {
            return Ok(());
        }
        if self.fulfilled.has(&peer.addr(), request::PAYMENT_SYNC_SERVE) {
            tracing::warn!(target: "payments", peer = peer.id(),
                "peer already asked for the payment list");
            return Err(PaymentError::RateLimited);
        }
        self.fulfilled.add(peer.addr(), request::PAYMENT_SYNC_SERVE);
        self.sync_to_peer(peer, sync);
        Ok(())
    }

    /// Send only votes for future blocks; everything else is requested
    /// per missing block individually.
    fn sync_to_peer(&self, peer: &dyn Peer, sync: &SyncDriver) {
        if !sync.is_winners_list_synced() {
            return;
        }
        let cached = self.cached_height();
        let mut count = 0i32;
        {
            let blocks = self.blocks.lock();
            for height in cached..cached + SYNC_LOOKAHEAD {
                let payees = match blocks.get(&height) {
                    Some(payees) => payees,
                    None => continue,
                };
                for payee in &payees.payees {
                    for hash in payee.vote_hashes() {
                        if !self.has_verified_payment_vote(hash) {
                            continue;
                        }
                        peer.push_inventory(Inv::new(InvKind::PaymentVote, hash.to_byte_array()));
                        count += 1;
                    }
                }
            }
        }
        tracing::info!(target: "payments", peer = peer.id(), count, "sent payment votes");
        peer.send(Message::SyncStatusCount { item_id: SYNC_VOTES, count });
    }

    /// Handle a relayed payment vote.
    pub fn process_vote(
        &self,
        peer: &dyn Peer,
        vote: PaymentVote,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
        service_node_mode: bool,
        bus: &dyn PeerBus,
    ) -> Result<(), PaymentError> {
        if peer.version() < self.sporks.min_payment_proto() {
            peer.send(Message::Reject {
                message: "fnpaymentvote".to_string(),
                code: 0x11,
                reason: format!("Version must be {} or greater", self.sporks.min_payment_proto()),
            });
            return Err(PaymentError::ObsoleteVersion);
        }

        let hash = vote.hash();
        peer.clear_ask_for(&hash.to_byte_array());

        if !sync.is_list_synced() {
            return Ok(());
        }

        {
            let mut votes = self.votes.lock();
            if let Some(existing) = votes.votes.get(&hash) {
                if existing.is_verified() {
                    tracing::debug!(target: "payments", %hash, "payment vote seen");
                    return Ok(());
                }
            }
            // occupy the slot unverified; acceptance below upgrades it
            let mut unverified = vote.clone();
            unverified.mark_as_not_verified();
            votes.votes.insert(hash, unverified);
        }

        let cached = self.cached_height();
        let first_block = cached - self.storage_limit(registry.size());
        if vote.block_height < first_block || vote.block_height > cached + VOTE_FUTURE_LIMIT {
            tracing::debug!(target: "payments", first_block, height = vote.block_height,
                tip = cached, "payment vote out of range");
            return Err(PaymentError::OutOfRange);
        }

        let info = self.vote_is_valid(&vote, peer, registry, sync, service_node_mode)?;

        let ban = sync.is_list_synced() && vote.block_height > cached;
        if let Err(err) =
            vote.check_signature(&info.pubkey_operator, self.sporks.is_new_sigs_active(), ban)
        {
            // either our registry entry or the vote is outdated; refresh
            // ours and drop the vote
            registry.ask_for_node(peer, &vote.voter_outpoint);
            return Err(err);
        }

        if !self.update_last_vote(&vote) {
            tracing::debug!(target: "payments",
                node = %vote.voter_outpoint.to_short_string(), "voter already voted");
            return Err(PaymentError::AlreadyVoted);
        }

        if self.add_or_update_payment_vote(&vote) {
            bus.relay_inv(Inv::new(InvKind::PaymentVote, hash.to_byte_array()));
            sync.bump_asset_last_time("payments::process_vote");
        }
        Ok(())
    }

    fn vote_is_valid(
        &self,
        vote: &PaymentVote,
        peer: &dyn Peer,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
        service_node_mode: bool,
    ) -> Result<crate::registry::ServiceNodeInfo, PaymentError> {
        let cached = self.cached_height();

        let info = match registry.get_info(&vote.voter_outpoint) {
            Some(info) => info,
            None => {
                // only ask when synced and still clueless about the voter
                if sync.is_list_synced() {
                    registry.ask_for_node(peer, &vote.voter_outpoint);
                }
                return Err(PaymentError::UnknownVoter);
            }
        };

        let min_required_proto = if vote.block_height >= cached {
            self.sporks.min_payment_proto()
        } else {
            // allow non-updated nodes for historical blocks
            MIN_PAYMENT_PROTO_VERSION_1
        };
        if info.protocol_version < min_required_proto {
            return Err(PaymentError::VoterProtocolTooOld);
        }

        // regular clients only verify ranks for future votes; voting
        // nodes must also check the past to pick future winners right
        if !service_node_mode && vote.block_height < cached {
            return Ok(info);
        }

        let rank = registry
            .get_rank(&vote.voter_outpoint, vote.block_height - 101, min_required_proto, sync)
            .ok_or(PaymentError::UnknownHeight)?;

        if rank > PAYMENT_VOTES_TOTAL {
            // nodes mistakenly thinking they are in the top 10 are common;
            // only a grossly wrong fresh vote is punishable
            let severe = rank > PAYMENT_VOTES_TOTAL * 2 && vote.block_height > cached;
            return Err(PaymentError::RankOutOfBounds { rank, severe });
        }

        Ok(info)
    }

    /// Serve getdata for a vote or a whole payment block.
    pub fn serve_inv(&self, peer: &dyn Peer, inv: &Inv) {
        match inv.kind() {
            Some(InvKind::PaymentVote) => {
                let votes = self.votes.lock();
                if let Some(vote) = votes.votes.get(&VoteHash::from_byte_array(inv.hash)) {
                    if vote.is_verified() {
                        peer.send(Message::PaymentVote(vote.clone()));
                    }
                }
            }
            Some(InvKind::PaymentBlock) => {
                let height = match self
                    .chain
                    .height_of(&crate::hash_types::BlockHash::from_byte_array(inv.hash))
                {
                    Some(height) => height,
                    None => return,
                };
                let hashes: Vec<VoteHash> = {
                    let blocks = self.blocks.lock();
                    match blocks.get(&height) {
                        Some(payees) => payees
                            .payees
                            .iter()
                            .flat_map(|payee| payee.vote_hashes().iter().copied())
                            .collect(),
                        None => return,
                    }
                };
                let votes = self.votes.lock();
                for hash in hashes {
                    if let Some(vote) = votes.votes.get(&hash) {
                        if vote.is_verified() {
                            peer.send(Message::PaymentVote(vote.clone()));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Ask one peer for the payment blocks we have no or weak data for.
    pub fn request_low_data_payment_blocks(
        &self,
        peer: &dyn Peer,
        registry_size: usize,
        sync: &SyncDriver,
    ) {
        if !sync.is_list_synced() {
            return;
        }

        let cached = self.cached_height();
        let limit = self.storage_limit(registry_size);
        let mut to_fetch: Vec<Inv> = Vec::new();

        {
            let blocks = self.blocks.lock();

            // blocks we know nothing about
            let mut height = cached;
            while height > 0 && cached - height < limit {
                if !blocks.contains_key(&height) {
                    if let Some(hash) = self.chain.block_hash(height) {
                        to_fetch.push(Inv::new(InvKind::PaymentBlock, hash.to_byte_array()));
                        if to_fetch.len() == MAX_INV_SIZE {
                            peer.send(Message::GetData(std::mem::take(&mut to_fetch)));
                        }
                    }
                }
                height -= 1;
            }

            // blocks with no clear winner and fewer votes than expected
            for (height, payees) in blocks.iter() {
                let mut total_votes = 0;
                let mut found = false;
                for payee in &payees.payees {
                    if payee.vote_count() >= PAYMENT_VOTES_REQUIRED {
                        found = true;
                        break;
                    }
                    total_votes += payee.vote_count();
                }
                if found
                    || total_votes >= (PAYMENT_VOTES_TOTAL + PAYMENT_VOTES_REQUIRED) / 2
                {
                    continue;
                }
                if let Some(hash) = self.chain.block_hash(*height) {
                    to_fetch.push(Inv::new(InvKind::PaymentBlock, hash.to_byte_array()));
                    if to_fetch.len() == MAX_INV_SIZE {
                        peer.send(Message::GetData(std::mem::take(&mut to_fetch)));
                    }
                }
            }
        }

        if !to_fetch.is_empty() {
            tracing::debug!(target: "payments", peer = peer.id(), count = to_fetch.len(),
                "asking for low-data payment blocks");
            peer.send(Message::GetData(to_fetch));
        }
    }

    /// Purge votes (and their block rows) that slid out of the window.
    pub fn check_and_remove(&self, registry_size: usize, sync: &SyncDriver) {
        if !sync.is_blockchain_synced() {
            return;
        }
        let cached = self.cached_height();
        let limit = self.storage_limit(registry_size);

        let mut blocks = self.blocks.lock();
        let mut votes = self.votes.lock();
        let stale: Vec<(VoteHash, i32)> = votes
            .votes
            .iter()
            .filter(|(_, vote)| cached - vote.block_height > limit)
            .map(|(hash, vote)| (*hash, vote.block_height))
            .collect();
        for (hash, height) in stale {
            votes.votes.remove(&hash);
            blocks.remove(&height);
        }
        tracing::info!(target: "payments", votes = votes.votes.len(),
            blocks = blocks.len(), "payment ledger housekeeping done");
    }

    /// Do we hold enough blocks and votes to call the sync complete?
    pub fn is_enough_data(&self, registry_size: usize) -> bool {
        let average_votes = (PAYMENT_VOTES_TOTAL + PAYMENT_VOTES_REQUIRED) / 2;
        let limit = self.storage_limit(registry_size) as usize;
        self.block_count() > limit && self.vote_count() > limit * average_votes
    }

    /// New tip: slide the window, audit the voters of the block about to
    /// be elected and cast our own vote ten blocks out.
    pub fn updated_block_tip(
        &self,
        height: i32,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
        local: Option<&LocalIdentity>,
        bus: &dyn PeerBus,
    ) {
        self.cached_height.store(height, Ordering::Relaxed);
        tracing::debug!(target: "payments", height, "updated block tip");

        let future = height + VOTE_LEAD;
        self.check_block_votes(future - 1, registry, sync);
        self.process_block(future, registry, sync, local, bus);
    }

    // ---- snapshot plumbing ---------------------------------------------

    pub(crate) fn export_snapshot(&self) -> crate::snapshot::LedgerSnapshot {
        let blocks = self.blocks.lock();
        let votes = self.votes.lock();
        crate::snapshot::LedgerSnapshot { votes: votes.votes.clone(), blocks: blocks.clone() }
    }

    pub(crate) fn apply_snapshot(&self, snapshot: crate::snapshot::LedgerSnapshot) {
        let mut blocks = self.blocks.lock();
        let mut votes = self.votes.lock();
        *blocks = snapshot.blocks;
        votes.votes = snapshot.votes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_types::{KeyId, Txid};
    use crate::test_utils::{test_ledger, test_ledger_with_chain, MockChain};

    fn vote(voter: u8, height: i32, payee_byte: u8) -> PaymentVote {
        PaymentVote::new(
            OutPoint::new(Txid::from_byte_array([voter; 32]), 0),
            height,
            ScriptBuf::new_p2pkh(&KeyId::from_byte_array([payee_byte; 20])),
        )
    }

    #[test]
    fn storage_limit_has_a_floor_and_grows() {
        let ledger = test_ledger();
        assert_eq!(ledger.storage_limit(0), 6000);
        assert_eq!(ledger.storage_limit(100), 6000);
        assert_eq!(ledger.storage_limit(4800), 6000);
        assert_eq!(ledger.storage_limit(4801), 6001);
        assert_eq!(ledger.storage_limit(8000), 10_000);
        // monotone in the registry size
        let mut previous = 0;
        for size in [0usize, 10, 1000, 4800, 5000, 10_000] {
            let limit = ledger.storage_limit(size);
            assert!(limit >= previous);
            previous = limit;
        }
    }

    #[test]
    fn vote_needs_the_anchor_block() {
        let ledger = test_ledger();
        // tip is 1000; height - 101 must exist
        assert!(ledger.add_or_update_payment_vote(&vote(1, 1010, 1)));
        assert!(!ledger.add_or_update_payment_vote(&vote(1, 1200, 1)));
    }

    #[test]
    fn duplicate_verified_vote_is_not_restored() {
        let ledger = test_ledger();
        let mut signed = vote(1, 1010, 1);
        signed.sig = vec![1u8; 65];
        assert!(ledger.add_or_update_payment_vote(&signed));
        assert!(ledger.has_verified_payment_vote(&signed.hash()));
        assert!(!ledger.add_or_update_payment_vote(&signed));
    }

    #[test]
    fn last_vote_is_one_per_height() {
        let ledger = test_ledger();
        let first = vote(1, 1010, 1);
        assert!(ledger.update_last_vote(&first));
        // same voter, same height: duplicate
        assert!(!ledger.update_last_vote(&vote(1, 1010, 2)));
        // same voter, newer height: re-vote moves the marker
        assert!(ledger.update_last_vote(&vote(1, 1011, 2)));
    }

    #[test]
    fn window_purge_drops_votes_and_blocks_together() {
        let chain = std::sync::Arc::new(MockChain::with_height(1000));
        let ledger = test_ledger_with_chain(chain.clone());
        let sync = crate::sync::SyncDriver::new(crate::params::Network::Mainnet, false);
        sync.force_asset(crate::sync::SYNC_FINISHED);

        assert!(ledger.add_or_update_payment_vote(&vote(1, 900, 1)));
        assert_eq!(ledger.vote_count(), 1);
        assert_eq!(ledger.block_count(), 1);

        chain.set_tip(900 + 6000 + 1);
        ledger.cached_height.store(900 + 6000 + 1, Ordering::Relaxed);
        ledger.check_and_remove(0, &sync);
        assert_eq!(ledger.vote_count(), 0);
        assert_eq!(ledger.block_count(), 0);
    }

    #[test]
    fn block_value_bounds_before_superblocks() {
        let ledger = test_ledger();
        // mainnet budget window around height 22000 (start 22180, so a
        // plain pre-superblock height)
        assert!(ledger.is_block_value_valid(&[], 100, 1000, 1000, true).is_ok());
        assert!(ledger.is_block_value_valid(&[], 100, 1000, 1001, true).is_err());
        // unsynced nodes accept budget-window blocks outright; mainnet's
        // budget window starts at the superblock height, so use the
        // regtest parameters for the window shape
        let regtest = PaymentLedger::new(
            std::sync::Arc::new(MockChain::with_height(1000)),
            crate::params::NetworkParams::regtest(),
            std::sync::Arc::new(SporkSet::new()),
            std::sync::Arc::new(crate::cache::FulfilledRequestCache::new(3600)),
            std::sync::Arc::new(NoSuperblocks),
        );
        assert!(regtest.is_block_value_valid(&[], 1005, 1000, 5000, false).is_ok());
        assert!(regtest.is_block_value_valid(&[], 1005, 1000, 5000, true).is_err());
    }

    #[test]
    fn payee_check_passes_without_enforcement() {
        let ledger = test_ledger();
        // not synced: everything passes
        assert!(ledger.is_block_payee_valid(&[], 30_000, 1000, 1000, false));
        // synced, no superblocks, no tally for the height: passes
        assert!(ledger.is_block_payee_valid(&[], 30_000, 1000, 1000, true));
    }

    #[test]
    fn scheduled_payees_look_eight_blocks_ahead() {
        let chain = std::sync::Arc::new(MockChain::with_height(1000));
        let ledger = test_ledger_with_chain(chain);
        ledger.cached_height.store(1000, Ordering::Relaxed);

        let payee = ScriptBuf::new_p2pkh(&KeyId::from_byte_array([1u8; 20]));
        for voter in 1..=3u8 {
            assert!(ledger.add_or_update_payment_vote(&vote(voter, 1005, 1)));
        }
        assert!(ledger.is_scheduled(&payee, 0, true));
        // the election height itself is excluded from the scan
        assert!(!ledger.is_scheduled(&payee, 1005, true));
        // and nothing is scheduled while the list is not synced
        assert!(!ledger.is_scheduled(&payee, 0, false));
    }

    #[test]
    fn payment_adjustment_decrements_the_neighbor() {
        let payee = ScriptBuf::new_p2pkh(&KeyId::from_byte_array([1u8; 20]));
        let miner = ScriptBuf::new_p2pkh(&KeyId::from_byte_array([2u8; 20]));
        let payment = TxOut { value: 100, script_pubkey: payee };
        let mut outputs =
            vec![TxOut { value: 1000, script_pubkey: miner.clone() }, payment.clone()];
        PaymentLedger::adjust_service_node_payment(&mut outputs, &payment);
        assert_eq!(outputs[0].value, 900);
        assert_eq!(outputs[1].value, 100);

        // an output that is not part of the coinbase changes nothing
        let foreign = TxOut { value: 7, script_pubkey: miner };
        PaymentLedger::adjust_service_node_payment(&mut outputs, &foreign);
        assert_eq!(outputs[0].value, 900);
    }
}
