//! Network selection, consensus parameters and the spork policy flags the
//! subsystem consumes as read-only inputs.

use std::sync::atomic::{AtomicBool, Ordering};

/// One coin in its smallest unit.
pub const COIN: i64 = 100_000_000;

/// The collateral a service node must lock.
pub const COLLATERAL_AMOUNT: i64 = 10_000 * COIN;

/// The exact output value marking a UTXO as service-node collateral.
pub const MAGIC_COLLATERAL_AMOUNT: i64 = 12_340_000; // 0.1234 coin

/// Current protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 70_211;

/// Last protocol version using the `TxIn`-enveloped outpoint wire format.
pub const LEGACY_OUTPOINT_VERSION: u32 = 70_208;

/// Minimum peer versions for payment messages, selected by the
/// pay-updated-nodes spork.
pub const MIN_PAYMENT_PROTO_VERSION_1: u32 = 70_210;
pub const MIN_PAYMENT_PROTO_VERSION_2: u32 = 70_211;

/// Minimum protocol for proof-of-service participation.
pub const MIN_POSE_PROTO_VERSION: u32 = 70_203;

/// State-check throttle per node.
pub const CHECK_SECONDS: i64 = 5;
/// Minimum age before an announce may be replaced by a newer one.
pub const MIN_ANNOUNCE_SECONDS: i64 = 5 * 60;
/// Minimum interval between accepted pings.
pub const MIN_PING_SECONDS: i64 = 10 * 60;
/// Sentinel activity window.
pub const SENTINEL_PING_MAX_SECONDS: i64 = 60 * 60;
/// Ping age at which a node expires.
pub const EXPIRATION_SECONDS: i64 = 120 * 60;
/// Ping age at which only a fresh announce can revive a node.
pub const NEW_START_REQUIRED_SECONDS: i64 = 180 * 60;

/// Proof-of-service ban threshold.
pub const POSE_BAN_MAX_SCORE: i32 = 5;
pub const MAX_POSE_CONNECTIONS: usize = 10;
pub const MAX_POSE_RANK: usize = 10;
pub const MAX_POSE_BLOCKS: i32 = 10;

/// Announce-recovery quorum parameters.
pub const RECOVERY_QUORUM_TOTAL: usize = 10;
pub const RECOVERY_QUORUM_REQUIRED: usize = 6;
pub const RECOVERY_MAX_ASK_ENTRIES: usize = 10;
pub const RECOVERY_WAIT_SECONDS: i64 = 60;
pub const RECOVERY_RETRY_SECONDS: i64 = 3 * 60 * 60;

/// How long a full-list request satisfies repeat asks.
pub const DSEG_UPDATE_SECONDS: i64 = 3 * 60 * 60;

/// Blocks scanned backwards per last-paid update.
pub const LAST_PAID_SCAN_BLOCKS: i32 = 100;

/// Pending direct-connection entries expire after this many seconds.
pub const PENDING_CONNECT_SECONDS: i64 = 15;

/// Default sentinel version reported before the field existed.
pub const DEFAULT_SENTINEL_VERSION: u32 = 0x01_0001;
/// Default daemon version reported before the field existed.
pub const DEFAULT_DAEMON_VERSION: u32 = 120_200;
/// Daemon version advertised in our own pings.
pub const CLIENT_VERSION: u32 = 120_205;

/// Payment vote quorum sizes.
pub const PAYMENT_VOTES_REQUIRED: usize = 6;
pub const PAYMENT_VOTES_TOTAL: usize = 10;

/// Largest inventory batch in a single getdata.
pub const MAX_INV_SIZE: usize = 50_000;

/// The network a node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
    Regtest,
}

impl Network {
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 12_919,
            Network::Testnet => 13_911,
            Network::Devnet => 13_911,
            Network::Regtest => 14_911,
        }
    }

    /// Whether several service nodes may share one IP on different ports.
    pub fn allow_multiple_ports(&self) -> bool {
        !matches!(self, Network::Mainnet)
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Mainnet)
    }

    /// Mainnet and testnet hold fresh nodes in PreEnabled; regtest and
    /// devnet skip the waiting period.
    pub fn requires_pre_enabled(&self) -> bool {
        matches!(self, Network::Mainnet | Network::Testnet)
    }
}

/// Consensus/network parameters the subsystem consumes. The surrounding
/// node supplies these; defaults follow the main network.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkParams {
    pub network: Network,
    /// Confirmations a collateral needs before the announce is accepted.
    pub min_collateral_confirmations: i32,
    /// First superblock height; the old budget logic applies below it.
    pub superblock_start_block: i32,
    pub budget_payments_start_block: i32,
    pub budget_payments_cycle_blocks: i32,
    pub budget_payments_window_blocks: i32,
    /// Share of the block reward paid to the elected service node, percent.
    pub payment_share_percent: i64,
    /// Per-peer fulfilled-request TTL.
    pub fulfilled_request_ttl: i64,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        NetworkParams {
            network: Network::Mainnet,
            min_collateral_confirmations: 15,
            superblock_start_block: 22_180,
            budget_payments_start_block: 22_180,
            budget_payments_cycle_blocks: 20_160,
            budget_payments_window_blocks: 100,
            payment_share_percent: 50,
            fulfilled_request_ttl: 60 * 60,
        }
    }

    pub fn testnet() -> Self {
        NetworkParams {
            network: Network::Testnet,
            min_collateral_confirmations: 1,
            superblock_start_block: 2_100_000_000,
            budget_payments_start_block: 2_100_000_000,
            budget_payments_cycle_blocks: 50,
            budget_payments_window_blocks: 10,
            payment_share_percent: 50,
            fulfilled_request_ttl: 5 * 60,
        }
    }

    pub fn regtest() -> Self {
        NetworkParams {
            network: Network::Regtest,
            min_collateral_confirmations: 1,
            superblock_start_block: 1_500,
            budget_payments_start_block: 1_000,
            budget_payments_cycle_blocks: 50,
            budget_payments_window_blocks: 10,
            payment_share_percent: 50,
            fulfilled_request_ttl: 5 * 60,
        }
    }

    /// The service-node slice of a block reward at the given height.
    pub fn service_node_payment(&self, _height: i32, block_reward: i64) -> i64 {
        block_reward * self.payment_share_percent / 100
    }

    /// Whether a height falls inside the deprecated budget-payment window.
    pub fn is_budget_window(&self, height: i32) -> bool {
        if height >= self.superblock_start_block || height < self.budget_payments_start_block {
            return false;
        }
        height % self.budget_payments_cycle_blocks < self.budget_payments_window_blocks
    }
}

/// Network-wide feature flags toggled out-of-band by a trusted key and
/// consumed here as read-only policy.
#[derive(Debug, Default)]
pub struct SporkSet {
    new_sigs: AtomicBool,
    require_sentinel_flag: AtomicBool,
    payment_enforcement: AtomicBool,
    pay_updated_nodes: AtomicBool,
    superblocks_enabled: AtomicBool,
}

impl SporkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new_sigs_active(&self) -> bool {
        self.new_sigs.load(Ordering::Relaxed)
    }

    pub fn set_new_sigs(&self, active: bool) {
        self.new_sigs.store(active, Ordering::Relaxed);
    }

    pub fn is_sentinel_flag_required(&self) -> bool {
        self.require_sentinel_flag.load(Ordering::Relaxed)
    }

    pub fn set_sentinel_flag_required(&self, active: bool) {
        self.require_sentinel_flag.store(active, Ordering::Relaxed);
    }

    pub fn is_payment_enforcement_active(&self) -> bool {
        self.payment_enforcement.load(Ordering::Relaxed)
    }

    pub fn set_payment_enforcement(&self, active: bool) {
        self.payment_enforcement.store(active, Ordering::Relaxed);
    }

    pub fn is_pay_updated_nodes_active(&self) -> bool {
        self.pay_updated_nodes.load(Ordering::Relaxed)
    }

    pub fn set_pay_updated_nodes(&self, active: bool) {
        self.pay_updated_nodes.store(active, Ordering::Relaxed);
    }

    pub fn are_superblocks_enabled(&self) -> bool {
        self.superblocks_enabled.load(Ordering::Relaxed)
    }

    pub fn set_superblocks_enabled(&self, active: bool) {
        self.superblocks_enabled.store(active, Ordering::Relaxed);
    }

    /// The minimum peer protocol for payment messages under the current
    /// policy.
    pub fn min_payment_proto(&self) -> u32 {
        if self.is_pay_updated_nodes_active() {
            MIN_PAYMENT_PROTO_VERSION_2
        } else {
            MIN_PAYMENT_PROTO_VERSION_1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_rules() {
        assert_eq!(Network::Mainnet.default_port(), 12_919);
        assert!(!Network::Mainnet.allow_multiple_ports());
        assert!(Network::Regtest.allow_multiple_ports());
    }

    #[test]
    fn min_payment_proto_follows_spork() {
        let sporks = SporkSet::new();
        assert_eq!(sporks.min_payment_proto(), MIN_PAYMENT_PROTO_VERSION_1);
        sporks.set_pay_updated_nodes(true);
        assert_eq!(sporks.min_payment_proto(), MIN_PAYMENT_PROTO_VERSION_2);
    }

    #[test]
    fn budget_window_bounds() {
        let params = NetworkParams::regtest();
        assert!(params.is_budget_window(1_000));
        assert!(params.is_budget_window(1_009));
        assert!(!params.is_budget_window(1_010));
        assert!(!params.is_budget_window(999));
        assert!(!params.is_budget_window(1_500));
    }

    #[test]
    fn payment_share() {
        let params = NetworkParams::mainnet();
        assert_eq!(params.service_node_payment(100, 10 * COIN), 5 * COIN);
    }
}
