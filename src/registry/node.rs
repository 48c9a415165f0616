//! The registry entry for a single service node and its state machine.

use std::collections::BTreeMap;
use std::io;

use bitcoin_hashes::{sha256d, Hash};

use crate::chain::ChainAdapter;
use crate::consensus::{encode, Decodable, Encodable};
use crate::hash_types::{BlockHash, GovernanceHash, ScoreHash};
use crate::params::{
    self, Network, CHECK_SECONDS, EXPIRATION_SECONDS, MIN_PING_SECONDS,
    NEW_START_REQUIRED_SECONDS, POSE_BAN_MAX_SCORE, SENTINEL_PING_MAX_SECONDS,
};
use crate::primitives::{OutPoint, NetAddress, PubKey, ScriptBuf};
use crate::registry::announce::ServiceNodePing;

/// The closed set of service-node states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceNodeState {
    PreEnabled,
    Enabled,
    Expired,
    OutpointSpent,
    UpdateRequired,
    SentinelPingExpired,
    NewStartRequired,
    PoSeBanned,
}

impl ServiceNodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceNodeState::PreEnabled => "PRE_ENABLED",
            ServiceNodeState::Enabled => "ENABLED",
            ServiceNodeState::Expired => "EXPIRED",
            ServiceNodeState::OutpointSpent => "OUTPOINT_SPENT",
            ServiceNodeState::UpdateRequired => "UPDATE_REQUIRED",
            ServiceNodeState::SentinelPingExpired => "SENTINEL_PING_EXPIRED",
            ServiceNodeState::NewStartRequired => "NEW_START_REQUIRED",
            ServiceNodeState::PoSeBanned => "POSE_BAN",
        }
    }

    fn to_i32(self) -> i32 {
        match self {
            ServiceNodeState::PreEnabled => 0,
            ServiceNodeState::Enabled => 1,
            ServiceNodeState::Expired => 2,
            ServiceNodeState::OutpointSpent => 3,
            ServiceNodeState::UpdateRequired => 4,
            ServiceNodeState::SentinelPingExpired => 5,
            ServiceNodeState::NewStartRequired => 6,
            ServiceNodeState::PoSeBanned => 7,
        }
    }

    fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => ServiceNodeState::PreEnabled,
            1 => ServiceNodeState::Enabled,
            2 => ServiceNodeState::Expired,
            3 => ServiceNodeState::OutpointSpent,
            4 => ServiceNodeState::UpdateRequired,
            5 => ServiceNodeState::SentinelPingExpired,
            6 => ServiceNodeState::NewStartRequired,
            7 => ServiceNodeState::PoSeBanned,
            _ => return None,
        })
    }

    /// States from which a node can come back on its own (fresh ping);
    /// anything else needs a new announce or operator action.
    pub fn is_valid_for_auto_start(&self) -> bool {
        matches!(
            self,
            ServiceNodeState::Enabled
                | ServiceNodeState::PreEnabled
                | ServiceNodeState::Expired
                | ServiceNodeState::SentinelPingExpired
        )
    }
}

impl Encodable for ServiceNodeState {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.to_i32().consensus_encode(w)
    }
}

impl Decodable for ServiceNodeState {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        ServiceNodeState::from_i32(i32::consensus_decode(r)?)
            .ok_or(encode::Error::ParseFailed("unknown service node state"))
    }
}

/// Collateral lookup outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollateralStatus {
    Ok { height: i32 },
    UtxoNotFound,
    InvalidAmount,
    InvalidPubkey,
}

/// Detached copy of a node's identity and liveness data, handed out to
/// callers so nothing iterates the registry while holding its lock.
#[derive(Debug, Clone, Default)]
pub struct ServiceNodeInfo {
    pub state: Option<ServiceNodeState>,
    pub protocol_version: u32,
    pub sig_time: i64,
    pub outpoint: OutPoint,
    pub addr: NetAddress,
    pub pubkey_collateral: PubKey,
    pub pubkey_operator: PubKey,
    pub last_dsq: i64,
    pub time_last_checked: i64,
    pub time_last_paid: i64,
    pub time_last_ping: i64,
}

impl ServiceNodeInfo {
    pub fn payee_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&self.pubkey_collateral.key_id())
    }
}

/// Everything `check` needs from its surroundings, gathered by the
/// registry before it walks the map.
#[derive(Clone)]
pub struct CheckContext {
    pub network: Network,
    pub tip_height: i32,
    pub adjusted_time: i64,
    pub now: i64,
    pub registry_size: usize,
    pub min_payment_proto: u32,
    pub list_synced: bool,
    pub sentinel_active: bool,
    /// Operator key of the locally configured service node, if any.
    pub our_operator_key: Option<PubKey>,
}

/// A currently known service node.
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub outpoint: OutPoint,
    pub addr: NetAddress,
    pub pubkey_collateral: PubKey,
    pub pubkey_operator: PubKey,
    pub last_ping: Option<ServiceNodePing>,
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub last_dsq: i64,
    pub time_last_checked: i64,
    pub time_last_paid: i64,
    pub state: ServiceNodeState,
    pub collateral_min_conf_block_hash: BlockHash,
    pub block_last_paid: i32,
    pub protocol_version: u32,
    pub pose_ban_score: i32,
    pub pose_ban_height: i32,
    pub allow_mixing: bool,
    pub governance_votes: BTreeMap<GovernanceHash, i32>,
}

impl ServiceNode {
    pub fn state_str(&self) -> &'static str {
        self.state.as_str()
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ServiceNodeState::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.state == ServiceNodeState::PreEnabled
    }

    pub fn is_expired(&self) -> bool {
        self.state == ServiceNodeState::Expired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.state == ServiceNodeState::OutpointSpent
    }

    pub fn is_update_required(&self) -> bool {
        self.state == ServiceNodeState::UpdateRequired
    }

    pub fn is_sentinel_ping_expired(&self) -> bool {
        self.state == ServiceNodeState::SentinelPingExpired
    }

    pub fn is_new_start_required(&self) -> bool {
        self.state == ServiceNodeState::NewStartRequired
    }

    pub fn is_pose_banned(&self) -> bool {
        self.state == ServiceNodeState::PoSeBanned
    }

    /// NOTE: verified status lives on the score, not the state.
    pub fn is_pose_verified(&self) -> bool {
        self.pose_ban_score <= -POSE_BAN_MAX_SCORE
    }

    pub fn increase_pose_ban_score(&mut self) {
        if self.pose_ban_score < POSE_BAN_MAX_SCORE {
            self.pose_ban_score += 1;
        }
    }

    pub fn decrease_pose_ban_score(&mut self) {
        if self.pose_ban_score > -POSE_BAN_MAX_SCORE {
            self.pose_ban_score -= 1;
        }
    }

    pub fn pose_ban(&mut self) {
        self.pose_ban_score = POSE_BAN_MAX_SCORE;
    }

    pub fn is_broadcast_within(&self, seconds: i64, now: i64) -> bool {
        now - self.sig_time < seconds
    }

    pub fn is_pinged_within(&self, seconds: i64, at: i64) -> bool {
        match &self.last_ping {
            Some(ping) => at - ping.sig_time < seconds,
            None => false,
        }
    }

    /// Whether the election may pick this node as a payee.
    pub fn is_valid_for_payment(&self, sentinel_flag_required: bool) -> bool {
        if self.state == ServiceNodeState::Enabled {
            return true;
        }
        !sentinel_flag_required && self.state == ServiceNodeState::SentinelPingExpired
    }

    pub fn is_valid_net_addr(&self, network: Network) -> bool {
        Self::addr_is_valid(&self.addr, network)
    }

    pub fn addr_is_valid(addr: &NetAddress, network: Network) -> bool {
        network == Network::Regtest || (addr.is_ipv4() && addr.is_routable())
    }

    pub fn payee_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&self.pubkey_collateral.key_id())
    }

    pub fn info(&self) -> ServiceNodeInfo {
        ServiceNodeInfo {
            state: Some(self.state),
            protocol_version: self.protocol_version,
            sig_time: self.sig_time,
            outpoint: self.outpoint,
            addr: self.addr,
            pubkey_collateral: self.pubkey_collateral.clone(),
            pubkey_operator: self.pubkey_operator.clone(),
            last_dsq: self.last_dsq,
            time_last_checked: self.time_last_checked,
            time_last_paid: self.time_last_paid,
            time_last_ping: self.last_ping.as_ref().map(|p| p.sig_time).unwrap_or(0),
        }
    }

    /// Deterministic election score for a node against a seed block hash:
    /// sha256d(outpoint ++ collateral confirmation hash ++ seed), read as
    /// a little-endian 256-bit integer.
    pub fn calculate_score(&self, seed: &BlockHash) -> ScoreHash {
        let mut preimage = Vec::new();
        self.outpoint.consensus_encode(&mut preimage).expect("in-memory writers don't error");
        self.collateral_min_conf_block_hash
            .consensus_encode(&mut preimage)
            .expect("in-memory writers don't error");
        seed.consensus_encode(&mut preimage).expect("in-memory writers don't error");
        ScoreHash::from_sha256d(sha256d::Hash::hash(&preimage))
    }

    /// Resolve the collateral UTXO and validate amount and destination.
    pub fn check_collateral(
        chain: &dyn ChainAdapter,
        outpoint: &OutPoint,
        pubkey: &PubKey,
    ) -> CollateralStatus {
        let coin = match chain.utxo(outpoint) {
            Some(coin) => coin,
            None => return CollateralStatus::UtxoNotFound,
        };
        if coin.value != params::MAGIC_COLLATERAL_AMOUNT {
            return CollateralStatus::InvalidAmount;
        }
        if pubkey.is_empty() || coin.script_pubkey != ScriptBuf::new_p2pkh(&pubkey.key_id()) {
            return CollateralStatus::InvalidPubkey;
        }
        CollateralStatus::Ok { height: coin.height }
    }

    /// Re-evaluate the node's state. Rate-limited unless `force`; the
    /// cascade returns at the first rule that fires.
    pub fn check(&mut self, ctx: &CheckContext, force: bool) {
        if !force && ctx.now - self.time_last_checked < CHECK_SECONDS {
            return;
        }
        self.time_last_checked = ctx.now;

        if self.is_outpoint_spent() {
            return;
        }

        if self.is_pose_banned() {
            if ctx.tip_height < self.pose_ban_height {
                return;
            }
            // Unbanned, but left on the edge: a few missed verifications
            // put it straight back.
            tracing::info!(target: "registry", node = %self.outpoint.to_short_string(),
                "service node is unbanned and back in the list");
            self.decrease_pose_ban_score();
        } else if self.pose_ban_score >= POSE_BAN_MAX_SCORE {
            self.state = ServiceNodeState::PoSeBanned;
            // ban for the whole payment cycle
            self.pose_ban_height = ctx.tip_height + ctx.registry_size as i32;
            tracing::info!(target: "registry", node = %self.outpoint.to_short_string(),
                until = self.pose_ban_height, "service node banned by proof-of-service");
            return;
        }

        let prev_state = self.state;
        let our_node = ctx
            .our_operator_key
            .as_ref()
            .map(|key| *key == self.pubkey_operator)
            .unwrap_or(false);

        let require_update = self.protocol_version < ctx.min_payment_proto
            || (our_node && self.protocol_version < params::PROTOCOL_VERSION);
        if require_update {
            self.set_state(prev_state, ServiceNodeState::UpdateRequired);
            return;
        }

        // keep old nodes on start, give them a chance to receive updates
        let wait_for_ping =
            !ctx.list_synced && !self.is_pinged_within(MIN_PING_SECONDS, ctx.adjusted_time);

        if wait_for_ping && !our_node {
            // if it was already expired before the initial check, keep it
            if self.is_expired() || self.is_sentinel_ping_expired() || self.is_new_start_required()
            {
                return;
            }
        }

        if !wait_for_ping || our_node {
            if !self.is_pinged_within(NEW_START_REQUIRED_SECONDS, ctx.adjusted_time) {
                self.set_state(prev_state, ServiceNodeState::NewStartRequired);
                return;
            }

            if !self.is_pinged_within(EXPIRATION_SECONDS, ctx.adjusted_time) {
                self.set_state(prev_state, ServiceNodeState::Expired);
                return;
            }

            if ctx.sentinel_active
                && !self.is_pinged_within(SENTINEL_PING_MAX_SECONDS, ctx.adjusted_time)
            {
                self.set_state(prev_state, ServiceNodeState::SentinelPingExpired);
                return;
            }
        }

        // fresh nodes wait out a full ping interval before being counted;
        // regtest and devnet skip the waiting room
        if ctx.network.requires_pre_enabled() {
            let ping_time = self.last_ping.as_ref().map(|p| p.sig_time).unwrap_or(0);
            if ping_time - self.sig_time < MIN_PING_SECONDS {
                self.set_state(prev_state, ServiceNodeState::PreEnabled);
                return;
            }
        }

        if !wait_for_ping || our_node {
            let sentinel_expired = ctx.sentinel_active
                && !self.last_ping.as_ref().map(|p| p.sentinel_is_current).unwrap_or(false);
            if sentinel_expired {
                self.set_state(prev_state, ServiceNodeState::SentinelPingExpired);
                return;
            }
        }

        self.set_state(prev_state, ServiceNodeState::Enabled);
    }

    fn set_state(&mut self, prev: ServiceNodeState, next: ServiceNodeState) {
        self.state = next;
        if prev != next {
            tracing::debug!(target: "registry", node = %self.outpoint.to_short_string(),
                state = next.as_str(), "service node state changed");
        }
    }

    /// Scan recent coinbases for the most recent payment to this node.
    pub fn update_last_paid<F>(
        &mut self,
        chain: &dyn ChainAdapter,
        max_blocks_to_scan: i32,
        expected_payment: F,
        has_quorum_payee: impl Fn(i32, &ScriptBuf) -> bool,
    ) where
        F: Fn(i32) -> i64,
    {
        let payee = self.payee_script();
        let tip = chain.tip_height();

        for height in (0..=tip).rev().take(max_blocks_to_scan as usize) {
            if height <= self.block_last_paid {
                break;
            }
            if !has_quorum_payee(height, &payee) {
                continue;
            }
            let outputs = match chain.coinbase_outputs(height) {
                Some(outputs) => outputs,
                None => continue,
            };
            let payment = expected_payment(height);
            if outputs.iter().any(|out| out.script_pubkey == payee && out.value == payment) {
                self.block_last_paid = height;
                self.time_last_paid = chain.block_time(height).unwrap_or(0);
                tracing::debug!(target: "payments", node = %self.outpoint.to_short_string(),
                    height, "found new last paid block");
                return;
            }
        }
    }

    pub fn add_governance_vote(&mut self, hash: GovernanceHash) {
        *self.governance_votes.entry(hash).or_insert(0) += 1;
    }

    pub fn remove_governance_object(&mut self, hash: &GovernanceHash) {
        self.governance_votes.remove(hash);
    }

    pub fn governance_vote_hashes(&self) -> Vec<GovernanceHash> {
        self.governance_votes.keys().copied().collect()
    }
}

impl Encodable for ServiceNode {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.outpoint.consensus_encode(w)?;
        len += self.addr.consensus_encode(w)?;
        len += self.pubkey_collateral.consensus_encode(w)?;
        len += self.pubkey_operator.consensus_encode(w)?;
        len += self.last_ping.clone().unwrap_or_default().consensus_encode(w)?;
        len += self.sig.consensus_encode(w)?;
        len += self.sig_time.consensus_encode(w)?;
        len += self.last_dsq.consensus_encode(w)?;
        len += self.time_last_checked.consensus_encode(w)?;
        len += self.time_last_paid.consensus_encode(w)?;
        len += self.state.consensus_encode(w)?;
        len += self.collateral_min_conf_block_hash.consensus_encode(w)?;
        len += self.block_last_paid.consensus_encode(w)?;
        len += self.protocol_version.consensus_encode(w)?;
        len += self.pose_ban_score.consensus_encode(w)?;
        len += self.pose_ban_height.consensus_encode(w)?;
        len += self.allow_mixing.consensus_encode(w)?;
        len += self.governance_votes.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for ServiceNode {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let outpoint = OutPoint::consensus_decode(r)?;
        let addr = NetAddress::consensus_decode(r)?;
        let pubkey_collateral = PubKey::consensus_decode(r)?;
        let pubkey_operator = PubKey::consensus_decode(r)?;
        let last_ping = ServiceNodePing::consensus_decode(r)?;
        let last_ping = if last_ping == ServiceNodePing::default() { None } else { Some(last_ping) };
        Ok(ServiceNode {
            outpoint,
            addr,
            pubkey_collateral,
            pubkey_operator,
            last_ping,
            sig: Decodable::consensus_decode(r)?,
            sig_time: Decodable::consensus_decode(r)?,
            last_dsq: Decodable::consensus_decode(r)?,
            time_last_checked: Decodable::consensus_decode(r)?,
            time_last_paid: Decodable::consensus_decode(r)?,
            state: Decodable::consensus_decode(r)?,
            collateral_min_conf_block_hash: Decodable::consensus_decode(r)?,
            block_last_paid: Decodable::consensus_decode(r)?,
            protocol_version: Decodable::consensus_decode(r)?,
            pose_ban_score: Decodable::consensus_decode(r)?,
            pose_ban_height: Decodable::consensus_decode(r)?,
            allow_mixing: Decodable::consensus_decode(r)?,
            governance_votes: Decodable::consensus_decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node_at, operator_key, ping_at, MockChain};

    fn ctx(chain: &MockChain) -> CheckContext {
        CheckContext {
            network: Network::Mainnet,
            tip_height: chain.tip_height(),
            adjusted_time: chain.adjusted_time(),
            now: chain.adjusted_time(),
            registry_size: 20,
            min_payment_proto: params::MIN_PAYMENT_PROTO_VERSION_1,
            list_synced: true,
            sentinel_active: false,
            our_operator_key: None,
        }
    }

    #[test]
    fn fresh_node_is_pre_enabled_then_enabled_on_mainnet() {
        let chain = MockChain::with_height(1000);
        let mut node = node_at(1, &chain);
        // announce and ping at the same instant: waiting room
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::PreEnabled);

        // a later ping clears the waiting period
        let ping_time = node.sig_time + MIN_PING_SECONDS;
        node.last_ping = Some(ping_at(node.outpoint, &chain, ping_time));
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::Enabled);
    }

    #[test]
    fn ping_expiry_cascade() {
        let chain = MockChain::with_height(1000);
        let mut node = node_at(1, &chain);
        let base = chain.adjusted_time();
        node.sig_time = base - 200 * 60;
        node.last_ping = Some(ping_at(node.outpoint, &chain, base - 121 * 60));
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::Expired);

        node.last_ping = Some(ping_at(node.outpoint, &chain, base - 181 * 60));
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::NewStartRequired);
    }

    #[test]
    fn pose_ban_fires_at_max_score_and_expires_by_height() {
        let chain = MockChain::with_height(1000);
        let mut node = node_at(1, &chain);
        node.pose_ban_score = POSE_BAN_MAX_SCORE;
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::PoSeBanned);
        assert_eq!(node.pose_ban_height, 1000 + 20);

        // still banned before the unban height
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::PoSeBanned);

        // once the tip passes the ban height the score decays and the
        // normal cascade resumes
        let mut late = ctx(&chain);
        late.tip_height = node.pose_ban_height;
        let ping_time = node.sig_time + MIN_PING_SECONDS;
        node.last_ping = Some(ping_at(node.outpoint, &chain, ping_time));
        node.check(&late, true);
        assert_eq!(node.pose_ban_score, POSE_BAN_MAX_SCORE - 1);
        assert_ne!(node.state, ServiceNodeState::PoSeBanned);
    }

    #[test]
    fn outdated_protocol_requires_update() {
        let chain = MockChain::with_height(1000);
        let mut node = node_at(1, &chain);
        node.protocol_version = params::MIN_PAYMENT_PROTO_VERSION_1 - 1;
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::UpdateRequired);
    }

    #[test]
    fn check_is_rate_limited_without_force() {
        let chain = MockChain::with_height(1000);
        let mut node = node_at(1, &chain);
        node.protocol_version = params::MIN_PAYMENT_PROTO_VERSION_1 - 1;
        node.time_last_checked = chain.adjusted_time();
        let before = node.state;
        node.check(&ctx(&chain), false);
        assert_eq!(node.state, before);
        node.check(&ctx(&chain), true);
        assert_eq!(node.state, ServiceNodeState::UpdateRequired);
    }

    #[test]
    fn sentinel_flag_gates_payment_validity() {
        let chain = MockChain::with_height(1000);
        let mut node = node_at(1, &chain);
        node.state = ServiceNodeState::SentinelPingExpired;
        assert!(node.is_valid_for_payment(false));
        assert!(!node.is_valid_for_payment(true));
        node.state = ServiceNodeState::Enabled;
        assert!(node.is_valid_for_payment(true));
    }

    #[test]
    fn score_is_deterministic() {
        let chain = MockChain::with_height(1000);
        let node = node_at(1, &chain);
        let seed = chain.block_hash(900).unwrap();
        assert_eq!(node.calculate_score(&seed), node.calculate_score(&seed));
        let other_seed = chain.block_hash(901).unwrap();
        assert_ne!(node.calculate_score(&seed), node.calculate_score(&other_seed));
    }

    #[test]
    fn collateral_check() {
        let chain = MockChain::with_height(1000);
        let key = operator_key(1);
        let outpoint = chain.add_collateral(key.public_key(), 900);
        assert_eq!(
            ServiceNode::check_collateral(&chain, &outpoint, key.public_key()),
            CollateralStatus::Ok { height: 900 }
        );
        let other = operator_key(2);
        assert_eq!(
            ServiceNode::check_collateral(&chain, &outpoint, other.public_key()),
            CollateralStatus::InvalidPubkey
        );
        let missing = OutPoint::new(crate::hash_types::Txid::from_byte_array([9u8; 32]), 0);
        assert_eq!(
            ServiceNode::check_collateral(&chain, &missing, key.public_key()),
            CollateralStatus::UtxoNotFound
        );
    }

    #[test]
    fn node_encoding_round_trip() {
        let chain = MockChain::with_height(1000);
        let mut node = node_at(1, &chain);
        node.add_governance_vote(GovernanceHash::from_byte_array([3u8; 32]));
        let encoded = crate::consensus::serialize(&node);
        let decoded: ServiceNode = crate::consensus::deserialize(&encoded).unwrap();
        assert_eq!(decoded.outpoint, node.outpoint);
        assert_eq!(decoded.state, node.state);
        assert_eq!(decoded.last_ping, node.last_ping);
        assert_eq!(decoded.governance_votes, node.governance_votes);
    }
}
