//! Hash newtypes used across the subsystem.

use std::cmp::Ordering;
use std::io;

use bitcoin_hashes::{hash160, hash_newtype, sha256d, Hash};

use crate::consensus::{encode, Decodable, Encodable};

hash_newtype! {
    /// A block hash on the host chain.
    pub struct BlockHash(sha256d::Hash);

    /// A transaction id.
    pub struct Txid(sha256d::Hash);

    /// Canonical hash identifying a service-node announce.
    pub struct AnnounceHash(sha256d::Hash);

    /// Canonical hash identifying a service-node ping.
    pub struct PingHash(sha256d::Hash);

    /// Canonical hash identifying a payment vote.
    pub struct VoteHash(sha256d::Hash);

    /// Canonical hash identifying a verification exchange.
    pub struct VerifyHash(sha256d::Hash);

    /// Hash160 of a serialized public key.
    pub struct KeyId(hash160::Hash);

    /// Identifier of a governance object a node has voted on.
    pub struct GovernanceHash(sha256d::Hash);
}

macro_rules! impl_hash_encode {
    ($ty:ident, $len:expr) => {
        impl Encodable for $ty {
            #[inline]
            fn consensus_encode<W: io::Write + ?Sized>(
                &self,
                w: &mut W,
            ) -> Result<usize, io::Error> {
                self.to_byte_array().consensus_encode(w)
            }
        }
        impl Decodable for $ty {
            #[inline]
            fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
                Ok($ty::from_byte_array(<[u8; $len]>::consensus_decode(r)?))
            }
        }
    };
}

impl_hash_encode!(BlockHash, 32);
impl_hash_encode!(Txid, 32);
impl_hash_encode!(AnnounceHash, 32);
impl_hash_encode!(PingHash, 32);
impl_hash_encode!(VoteHash, 32);
impl_hash_encode!(VerifyHash, 32);
impl_hash_encode!(KeyId, 20);
impl_hash_encode!(GovernanceHash, 32);

/// Render a 256-bit hash the way the reference client prints them:
/// hex of the bytes in reverse order.
pub fn hash_hex(bytes: &[u8; 32]) -> String {
    let mut rev = *bytes;
    rev.reverse();
    hex::encode(rev)
}

/// Render a key id the way the reference client prints a uint160.
pub fn key_id_hex(id: &KeyId) -> String {
    let mut rev = id.to_byte_array();
    rev.reverse();
    hex::encode(rev)
}

/// A 256-bit hash interpreted as a little-endian unsigned integer, for
/// score comparisons in the payment election and ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScoreHash([u8; 32]);

impl ScoreHash {
    pub const ZERO: ScoreHash = ScoreHash([0u8; 32]);

    pub fn from_sha256d(hash: sha256d::Hash) -> Self {
        ScoreHash(hash.to_byte_array())
    }

    pub fn to_byte_array(self) -> [u8; 32] {
        self.0
    }
}

impl Ord for ScoreHash {
    fn cmp(&self, other: &Self) -> Ordering {
        // little-endian integer comparison: most significant byte last
        for i in (0..32).rev() {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for ScoreHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_compares_as_little_endian_integer() {
        let mut lo = [0u8; 32];
        lo[0] = 0xFF; // value 0xFF
        let mut hi = [0u8; 32];
        hi[31] = 0x01; // value 1 << 248
        assert!(ScoreHash(hi) > ScoreHash(lo));
        assert_eq!(ScoreHash(lo).cmp(&ScoreHash(lo)), Ordering::Equal);
    }

    #[test]
    fn hash_hex_is_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xAB;
        let s = hash_hex(&bytes);
        assert!(s.starts_with("00"));
        assert!(s.ends_with("ab"));
    }

    #[test]
    fn hash_encoding_round_trip() {
        let hash = BlockHash::from_byte_array([7u8; 32]);
        let encoded = crate::consensus::serialize(&hash);
        assert_eq!(encoded.len(), 32);
        let decoded: BlockHash = crate::consensus::deserialize(&encoded).unwrap();
        assert_eq!(decoded, hash);
    }
}
