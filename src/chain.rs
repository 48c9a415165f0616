//! The narrow chain-state interface the subsystem consumes.

use crate::hash_types::BlockHash;
use crate::primitives::{OutPoint, ScriptBuf, TxOut};

/// An unspent output as far as collateral checks are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: ScriptBuf,
    /// Height of the block the output was created in.
    pub height: i32,
}

/// Chain queries the core treats as cheap; any caching is the adapter's
/// business. Implemented by the surrounding node, mocked in tests.
pub trait ChainAdapter: Send + Sync {
    /// Height of the active chain tip.
    fn tip_height(&self) -> i32;

    /// Hash of the block at `height` on the active chain.
    fn block_hash(&self, height: i32) -> Option<BlockHash>;

    /// Height of a known block hash, `None` for unknown or stale forks.
    fn height_of(&self, hash: &BlockHash) -> Option<i32>;

    /// Timestamp of the block at `height`.
    fn block_time(&self, height: i32) -> Option<i64>;

    /// Base block subsidy at `height`, before fees.
    fn block_subsidy(&self, height: i32) -> i64;

    /// Look up an unspent output.
    fn utxo(&self, outpoint: &OutPoint) -> Option<Coin>;

    /// Confirmations of an unspent output, `None` when unknown or spent.
    fn confirmations(&self, outpoint: &OutPoint) -> Option<i32> {
        self.utxo(outpoint).map(|coin| self.tip_height() - coin.height + 1)
    }

    /// Wall time corrected by the median peer offset.
    fn adjusted_time(&self) -> i64;

    /// A uniform random integer in `[0, n)`.
    fn rand_below(&self, n: i32) -> i32;

    /// Outputs of the coinbase transaction at `height`, for the last-paid
    /// back-scan.
    fn coinbase_outputs(&self, height: i32) -> Option<Vec<TxOut>>;
}

/// Plain wall-clock seconds; kept separate from `adjusted_time` because
/// local rate limits must not move with peer clock skew.
pub fn wall_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
