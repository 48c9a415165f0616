//! Primitive chain and network types shared by every message in the
//! subsystem.

pub mod address;
pub mod outpoint;
pub mod pubkey;
pub mod script;

use crate::consensus::encode::impl_consensus_encoding;

pub use address::NetAddress;
pub use outpoint::{LegacyTxIn, OutPoint};
pub use pubkey::PubKey;
pub use script::ScriptBuf;

/// A transaction output, as far as this subsystem needs one: an amount and
/// the locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: ScriptBuf,
}

impl_consensus_encoding!(TxOut, value, script_pubkey);
