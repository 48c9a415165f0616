//! Mock chain, peers and key fixtures shared by the test suites.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use bitcoin_hashes::{sha256d, Hash, HashEngine};
use parking_lot::Mutex;

use crate::active::ConnectivityCheck;
use crate::cache::FulfilledRequestCache;
use crate::chain::{ChainAdapter, Coin};
use crate::crypto::OperatorKeyPair;
use crate::hash_types::{BlockHash, Txid};
use crate::net::{Inv, Message, Peer, PeerBus};
use crate::params::{self, NetworkParams, SporkSet, COIN, MAGIC_COLLATERAL_AMOUNT};
use crate::payments::{NoSuperblocks, PaymentLedger};
use crate::primitives::{NetAddress, OutPoint, PubKey, ScriptBuf, TxOut};
use crate::registry::{ServiceNode, ServiceNodeAnnounce, ServiceNodePing, ServiceNodeRegistry};

pub const TEST_SECRET_HEX: &str =
    "1111111111111111111111111111111111111111111111111111111111111111";

/// Fixed wall-clock start for the mock chain.
const BASE_TIME: i64 = 1_700_000_000;
/// Target block spacing of the mock chain.
const BLOCK_SPACING: i64 = 150;

/// Deterministic in-memory chain view.
pub struct MockChain {
    tip: AtomicI32,
    adjusted_offset: AtomicI32,
    rand_counter: AtomicI32,
    utxos: Mutex<BTreeMap<OutPoint, Coin>>,
    coinbases: Mutex<BTreeMap<i32, Vec<TxOut>>>,
    collateral_counter: AtomicI32,
}

impl MockChain {
    pub fn with_height(tip: i32) -> Self {
        MockChain {
            tip: AtomicI32::new(tip),
            adjusted_offset: AtomicI32::new(0),
            rand_counter: AtomicI32::new(0),
            utxos: Mutex::new(BTreeMap::new()),
            coinbases: Mutex::new(BTreeMap::new()),
            collateral_counter: AtomicI32::new(0),
        }
    }

    pub fn set_tip(&self, height: i32) {
        self.tip.store(height, Ordering::Relaxed);
    }

    pub fn advance_time(&self, seconds: i32) {
        self.adjusted_offset.fetch_add(seconds, Ordering::Relaxed);
    }

    /// Create a magic-amount collateral UTXO paying `pubkey` at `height`.
    pub fn add_collateral(&self, pubkey: &PubKey, height: i32) -> OutPoint {
        let n = self.collateral_counter.fetch_add(1, Ordering::Relaxed);
        let mut txid_bytes = [0xC0u8; 32];
        txid_bytes[0] = (n & 0xFF) as u8;
        txid_bytes[1] = ((n >> 8) & 0xFF) as u8;
        let outpoint = OutPoint::new(Txid::from_byte_array(txid_bytes), 0);
        self.utxos.lock().insert(
            outpoint,
            Coin {
                value: MAGIC_COLLATERAL_AMOUNT,
                script_pubkey: ScriptBuf::new_p2pkh(&pubkey.key_id()),
                height,
            },
        );
        outpoint
    }

    /// Mirror a specific collateral, for replica tests sharing outpoints.
    pub fn add_collateral_at(&self, outpoint: &OutPoint, coin: Coin) {
        self.utxos.lock().insert(*outpoint, coin);
    }

    pub fn spend(&self, outpoint: &OutPoint) {
        self.utxos.lock().remove(outpoint);
    }

    pub fn set_coinbase(&self, height: i32, outputs: Vec<TxOut>) {
        self.coinbases.lock().insert(height, outputs);
    }
}

impl ChainAdapter for MockChain {
    fn tip_height(&self) -> i32 {
        self.tip.load(Ordering::Relaxed)
    }

    fn block_hash(&self, height: i32) -> Option<BlockHash> {
        if height < 0 || height > self.tip_height() {
            return None;
        }
        let mut engine = sha256d::Hash::engine();
        engine.input(b"block");
        engine.input(&height.to_le_bytes());
        Some(BlockHash::from_raw_hash(sha256d::Hash::from_engine(engine)))
    }

    fn height_of(&self, hash: &BlockHash) -> Option<i32> {
        (0..=self.tip_height()).find(|height| self.block_hash(*height).as_ref() == Some(hash))
    }

    fn block_time(&self, height: i32) -> Option<i64> {
        if height < 0 || height > self.tip_height() {
            return None;
        }
        Some(BASE_TIME - (self.tip_height() - height) as i64 * BLOCK_SPACING)
    }

    fn block_subsidy(&self, _height: i32) -> i64 {
        10 * COIN
    }

    fn utxo(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.utxos.lock().get(outpoint).cloned()
    }

    fn adjusted_time(&self) -> i64 {
        BASE_TIME + self.adjusted_offset.load(Ordering::Relaxed) as i64
    }

    fn rand_below(&self, n: i32) -> i32 {
        if n <= 0 {
            return 0;
        }
        self.rand_counter.fetch_add(1, Ordering::Relaxed) % n
    }

    fn coinbase_outputs(&self, height: i32) -> Option<Vec<TxOut>> {
        self.coinbases.lock().get(&height).cloned()
    }
}

/// A connectivity stub with a fixed answer.
pub struct StubConnectivity {
    pub address: Option<NetAddress>,
    pub reachable: bool,
}

impl ConnectivityCheck for StubConnectivity {
    fn detect_external_address(&self, _peers: &[Arc<dyn Peer>]) -> Option<NetAddress> {
        self.address
    }

    fn probe_inbound(&self, _addr: &NetAddress) -> bool {
        self.reachable
    }
}

// ---- keys and fixtures --------------------------------------------------

#[derive(Clone)]
pub struct NodeKeys {
    pub collateral: OperatorKeyPair,
    pub operator: OperatorKeyPair,
}

pub fn operator_key(seed: u8) -> OperatorKeyPair {
    OperatorKeyPair::from_secret_bytes(&[seed.max(1); 32], true).expect("valid test secret")
}

pub fn node_keys(seed: u8) -> NodeKeys {
    NodeKeys { collateral: operator_key(seed), operator: operator_key(seed.wrapping_add(100)) }
}

pub fn test_addr(seed: u8) -> NetAddress {
    NetAddress::new_ipv4(Ipv4Addr::new(8, 8, 8, seed), params::Network::Mainnet.default_port())
}

/// A ping anchored to the mock chain with an explicit signature time.
pub fn ping_at(outpoint: OutPoint, chain: &MockChain, sig_time: i64) -> ServiceNodePing {
    let mut ping = ServiceNodePing::new(outpoint, chain).expect("chain long enough");
    ping.sig_time = sig_time;
    ping
}

/// A fully populated enabled node backed by a real collateral.
pub fn node_at(seed: u8, chain: &MockChain) -> ServiceNode {
    let keys = node_keys(seed);
    let collateral_height = chain.tip_height() - 100;
    let outpoint = chain.add_collateral(keys.collateral.public_key(), collateral_height);
    let now = chain.adjusted_time();
    ServiceNode {
        outpoint,
        addr: test_addr(seed),
        pubkey_collateral: keys.collateral.public_key().clone(),
        pubkey_operator: keys.operator.public_key().clone(),
        last_ping: Some(ping_at(outpoint, chain, now)),
        sig: Vec::new(),
        sig_time: now,
        last_dsq: 0,
        time_last_checked: 0,
        time_last_paid: 0,
        state: crate::registry::ServiceNodeState::Enabled,
        collateral_min_conf_block_hash: chain
            .block_hash(collateral_height + 14)
            .expect("within chain"),
        block_last_paid: 0,
        protocol_version: params::PROTOCOL_VERSION,
        pose_ban_score: 0,
        pose_ban_height: 0,
        allow_mixing: true,
        governance_votes: BTreeMap::new(),
    }
}

/// An unsigned announce with a collateral on the chain.
pub fn announce_for(seed: u8, chain: &MockChain) -> (ServiceNodeAnnounce, NodeKeys) {
    let keys = node_keys(seed);
    let collateral_height = (chain.tip_height() - 100).max(0);
    let outpoint = chain.add_collateral(keys.collateral.public_key(), collateral_height);
    let mut announce = ServiceNodeAnnounce::new(
        outpoint,
        test_addr(seed),
        keys.collateral.public_key().clone(),
        keys.operator.public_key().clone(),
        params::PROTOCOL_VERSION,
    );
    announce.sig_time = chain.adjusted_time();
    (announce, keys)
}

// ---- component fixtures --------------------------------------------------

pub fn test_registry() -> ServiceNodeRegistry {
    test_registry_with_nodes(0).0
}

pub fn test_registry_with_nodes(count: u8) -> (ServiceNodeRegistry, Arc<MockChain>) {
    let chain = Arc::new(MockChain::with_height(1000));
    let registry = ServiceNodeRegistry::new(
        chain.clone(),
        NetworkParams::mainnet(),
        Arc::new(SporkSet::new()),
        Arc::new(FulfilledRequestCache::new(3600)),
        Arc::new(AtomicBool::new(false)),
    );
    let mut snapshot = crate::snapshot::RegistrySnapshot::default();
    for seed in 1..=count {
        let node = node_at(seed, &chain);
        snapshot.nodes.insert(node.outpoint, node);
    }
    registry.apply_snapshot(snapshot);
    (registry, chain)
}

pub fn test_ledger() -> PaymentLedger {
    test_ledger_with_chain(Arc::new(MockChain::with_height(1000)))
}

pub fn test_ledger_with_chain(chain: Arc<MockChain>) -> PaymentLedger {
    PaymentLedger::new(
        chain,
        NetworkParams::mainnet(),
        Arc::new(SporkSet::new()),
        Arc::new(FulfilledRequestCache::new(3600)),
        Arc::new(NoSuperblocks),
    )
}

/// All components over one shared mock chain.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub sporks: Arc<SporkSet>,
    pub fulfilled: Arc<FulfilledRequestCache>,
    pub registry: ServiceNodeRegistry,
    pub ledger: PaymentLedger,
    pub sync: crate::sync::SyncDriver,
    pub bus: MockBus,
}

pub fn harness(tip: i32) -> Harness {
    let chain = Arc::new(MockChain::with_height(tip));
    let sporks = Arc::new(SporkSet::new());
    let fulfilled = Arc::new(FulfilledRequestCache::new(3600));
    let registry = ServiceNodeRegistry::new(
        chain.clone(),
        NetworkParams::mainnet(),
        sporks.clone(),
        fulfilled.clone(),
        Arc::new(AtomicBool::new(false)),
    );
    let ledger = PaymentLedger::new(
        chain.clone(),
        NetworkParams::mainnet(),
        sporks.clone(),
        fulfilled.clone(),
        Arc::new(NoSuperblocks),
    );
    let sync = crate::sync::SyncDriver::new(params::Network::Mainnet, false);
    Harness { chain, sporks, fulfilled, registry, ledger, sync, bus: MockBus::new() }
}

/// A fully signed announce (with a fresh signed ping) whose announce
/// signature time lies `announce_age` seconds in the past.
pub fn signed_announce(
    seed: u8,
    chain: &MockChain,
    new_sigs: bool,
    announce_age: i64,
) -> (ServiceNodeAnnounce, NodeKeys) {
    let (mut announce, keys) = announce_for(seed, chain);
    let mut ping =
        ServiceNodePing::new(announce.outpoint, chain).expect("chain long enough");
    ping.sign(&keys.operator, new_sigs, chain.adjusted_time());
    announce.last_ping = ping;
    announce.sign(&keys.collateral, new_sigs, chain.adjusted_time() - announce_age);
    (announce, keys)
}

// ---- peers ----------------------------------------------------------------

/// A peer handle that records everything sent through it.
pub struct MockPeer {
    id: u64,
    addr: NetAddress,
    version: u32,
    inbound: bool,
    service_node_conn: bool,
    pub sent: Mutex<Vec<Message>>,
    pub inventories: Mutex<Vec<Inv>>,
    pub misbehavior: AtomicU32,
    pub disconnected: AtomicBool,
}

impl MockPeer {
    pub fn new(id: u64, addr: NetAddress) -> Self {
        MockPeer {
            id,
            addr,
            version: params::PROTOCOL_VERSION,
            inbound: false,
            service_node_conn: false,
            sent: Mutex::new(Vec::new()),
            inventories: Mutex::new(Vec::new()),
            misbehavior: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn sent_commands(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|message| message.command()).collect()
    }

    pub fn misbehavior_score(&self) -> u32 {
        self.misbehavior.load(Ordering::Relaxed)
    }
}

impl Peer for MockPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn addr(&self) -> NetAddress {
        self.addr
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn send_version(&self) -> u32 {
        self.version
    }

    fn is_inbound(&self) -> bool {
        self.inbound
    }

    fn is_service_node_conn(&self) -> bool {
        self.service_node_conn
    }

    fn send(&self, message: Message) {
        self.sent.lock().push(message);
    }

    fn push_inventory(&self, inv: Inv) {
        self.inventories.lock().push(inv);
    }

    fn clear_ask_for(&self, _hash: &[u8; 32]) {}

    fn misbehave(&self, score: u32) {
        self.misbehavior.fetch_add(score, Ordering::Relaxed);
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
    }
}

/// A peer bus over a vector of mock peers.
pub struct MockBus {
    pub peer_list: Mutex<Vec<Arc<MockPeer>>>,
    pub relayed: Mutex<Vec<Inv>>,
    pub pending_service_nodes: Mutex<Vec<NetAddress>>,
}

impl MockBus {
    pub fn new() -> Self {
        MockBus {
            peer_list: Mutex::new(Vec::new()),
            relayed: Mutex::new(Vec::new()),
            pending_service_nodes: Mutex::new(Vec::new()),
        }
    }

    pub fn add_peer(&self, peer: Arc<MockPeer>) {
        self.peer_list.lock().push(peer);
    }

    pub fn relayed_kinds(&self) -> Vec<u32> {
        self.relayed.lock().iter().map(|inv| inv.kind).collect()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        MockBus::new()
    }
}

impl PeerBus for MockBus {
    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.peer_list.lock().iter().map(|peer| peer.clone() as Arc<dyn Peer>).collect()
    }

    fn relay_inv(&self, inv: Inv) {
        self.relayed.lock().push(inv);
    }

    fn find_peer(&self, addr: &NetAddress) -> Option<Arc<dyn Peer>> {
        self.peer_list
            .lock()
            .iter()
            .find(|peer| peer.addr == *addr)
            .map(|peer| peer.clone() as Arc<dyn Peer>)
    }

    fn add_pending_service_node(&self, addr: NetAddress) {
        self.pending_service_nodes.lock().push(addr);
    }

    fn is_service_node_or_disconnect_requested(&self, _addr: &NetAddress) -> bool {
        false
    }
}
