//! Collateral outpoints and the legacy transaction-input envelope used by
//! 70208 peers.

use std::cmp::Ordering;
use std::fmt;
use std::io;

use bitcoin_hashes::Hash;

use crate::consensus::{encode, Decodable, Encodable, VarInt};
use crate::hash_types::{hash_hex, Txid};

/// A reference to a transaction output: the stable identity of a service
/// node's collateral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

impl Default for OutPoint {
    fn default() -> Self {
        OutPoint::null()
    }
}

impl OutPoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// The null outpoint, used on the wire to request the full registry.
    pub fn null() -> Self {
        OutPoint { txid: Txid::from_byte_array([0u8; 32]), vout: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        *self == OutPoint::null()
    }

    /// Short form `txid-vout` as the reference client prints it; part of
    /// the legacy signature strings, so the layout is load-bearing.
    pub fn to_short_string(&self) -> String {
        format!("{}-{}", hash_hex(&self.txid.to_byte_array()), self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COutPoint({}, {})", &hash_hex(&self.txid.to_byte_array())[..10], self.vout)
    }
}

impl Ord for OutPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        // the reference implementation memcmp's the txid in storage order
        self.txid
            .to_byte_array()
            .cmp(&other.txid.to_byte_array())
            .then(self.vout.cmp(&other.vout))
    }
}

impl PartialOrd for OutPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.txid.consensus_encode(w)? + self.vout.consensus_encode(w)?)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(OutPoint { txid: Decodable::consensus_decode(r)?, vout: Decodable::consensus_decode(r)? })
    }
}

/// An outpoint wrapped in the pre-70209 `CTxIn` wire envelope: the outpoint
/// followed by an empty scriptSig and an all-ones sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyTxIn(pub OutPoint);

impl Encodable for LegacyTxIn {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.0.consensus_encode(w)?;
        len += VarInt(0).consensus_encode(w)?;
        len += 0xFFFF_FFFFu32.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for LegacyTxIn {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let outpoint = OutPoint::consensus_decode(r)?;
        let _script_sig = Vec::<u8>::consensus_decode(r)?;
        let _sequence = u32::consensus_decode(r)?;
        Ok(LegacyTxIn(outpoint))
    }
}

/// The string form of a legacy input, reproduced for the pre-hash ping
/// signature message.
pub fn legacy_txin_string(outpoint: &OutPoint) -> String {
    format!("CTxIn({}, scriptSig=)", outpoint)
}
