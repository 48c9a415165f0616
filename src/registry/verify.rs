//! The mutual-challenge verification message.
//!
//! One message type plays three roles: a challenge carries no signatures,
//! a reply carries the responder's signature, a broadcast carries both.

use std::io;

use bitcoin_hashes::{sha256d, Hash};

use crate::consensus::{encode, Decodable, Encodable};
use crate::crypto::{HashSigner, MessageSigner, OperatorKeyPair};
use crate::error::RegistryError;
use crate::hash_types::{hash_hex, BlockHash, VerifyHash};
use crate::params::{LEGACY_OUTPOINT_VERSION, PROTOCOL_VERSION};
use crate::primitives::{LegacyTxIn, NetAddress, OutPoint, PubKey};

fn feed<T: Encodable + ?Sized>(buf: &mut Vec<u8>, value: &T) {
    value.consensus_encode(buf).expect("in-memory writers don't error");
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceNodeVerification {
    pub outpoint1: OutPoint,
    pub outpoint2: OutPoint,
    pub addr: NetAddress,
    pub nonce: i32,
    pub block_height: i32,
    pub sig1: Vec<u8>,
    pub sig2: Vec<u8>,
}

impl ServiceNodeVerification {
    /// A fresh challenge: address, nonce and height, no signatures yet.
    pub fn challenge(addr: NetAddress, nonce: i32, block_height: i32) -> Self {
        ServiceNodeVerification { addr, nonce, block_height, ..Default::default() }
    }

    pub fn is_challenge(&self) -> bool {
        self.sig1.is_empty()
    }

    pub fn is_reply(&self) -> bool {
        !self.sig1.is_empty() && self.sig2.is_empty()
    }

    /// Seen-cache identity; keeps the historical dummy pad after each
    /// outpoint.
    pub fn hash(&self) -> VerifyHash {
        let mut preimage = Vec::new();
        feed(&mut preimage, &self.outpoint1);
        feed(&mut preimage, &0u8);
        feed(&mut preimage, &0xFFFF_FFFFu32);
        feed(&mut preimage, &self.outpoint2);
        feed(&mut preimage, &0u8);
        feed(&mut preimage, &0xFFFF_FFFFu32);
        feed(&mut preimage, &self.addr);
        feed(&mut preimage, &self.nonce);
        feed(&mut preimage, &self.block_height);
        VerifyHash::from_raw_hash(sha256d::Hash::hash(&preimage))
    }

    /// Hash the responder signs: proves control of the address at a
    /// specific chain segment and nonce.
    pub fn signature_hash1(&self, block_hash: &BlockHash) -> [u8; 32] {
        let mut preimage = Vec::new();
        feed(&mut preimage, &self.addr);
        feed(&mut preimage, &self.nonce);
        feed(&mut preimage, block_hash);
        sha256d::Hash::hash(&preimage).to_byte_array()
    }

    /// Hash the initiator signs over the completed exchange.
    pub fn signature_hash2(&self, block_hash: &BlockHash) -> [u8; 32] {
        let mut preimage = Vec::new();
        feed(&mut preimage, &self.outpoint1);
        feed(&mut preimage, &self.outpoint2);
        feed(&mut preimage, &self.addr);
        feed(&mut preimage, &self.nonce);
        feed(&mut preimage, block_hash);
        sha256d::Hash::hash(&preimage).to_byte_array()
    }

    fn legacy_message1(&self, block_hash: &BlockHash) -> String {
        format!(
            "{}{}{}",
            self.addr.to_ip_port_string(),
            self.nonce,
            hash_hex(&block_hash.to_byte_array())
        )
    }

    fn legacy_message2(&self, block_hash: &BlockHash) -> String {
        format!(
            "{}{}{}",
            self.legacy_message1(block_hash),
            self.outpoint1.to_short_string(),
            self.outpoint2.to_short_string()
        )
    }

    pub fn sign_reply(&mut self, key: &OperatorKeyPair, block_hash: &BlockHash, new_sigs: bool) {
        self.sig1 = if new_sigs {
            HashSigner::sign(self.signature_hash1(block_hash), key)
        } else {
            MessageSigner::sign(&self.legacy_message1(block_hash), key)
        };
    }

    pub fn verify_reply(
        &self,
        pubkey: &PubKey,
        block_hash: &BlockHash,
        new_sigs: bool,
    ) -> Result<(), RegistryError> {
        let ok = if new_sigs {
            // replies in the old format are not accepted once the flag is up
            HashSigner::verify(self.signature_hash1(block_hash), pubkey, &self.sig1).is_ok()
        } else {
            MessageSigner::verify(&self.legacy_message1(block_hash), pubkey, &self.sig1).is_ok()
        };
        if ok {
            Ok(())
        } else {
            Err(RegistryError::InvalidSignature)
        }
    }

    pub fn sign_broadcast(&mut self, key: &OperatorKeyPair, block_hash: &BlockHash, new_sigs: bool) {
        self.sig2 = if new_sigs {
            HashSigner::sign(self.signature_hash2(block_hash), key)
        } else {
            MessageSigner::sign(&self.legacy_message2(block_hash), key)
        };
    }

    pub fn verify_broadcast(
        &self,
        pubkey1: &PubKey,
        pubkey2: &PubKey,
        block_hash: &BlockHash,
        new_sigs: bool,
    ) -> Result<(), RegistryError> {
        let (ok1, ok2) = if new_sigs {
            (
                HashSigner::verify(self.signature_hash1(block_hash), pubkey1, &self.sig1).is_ok(),
                HashSigner::verify(self.signature_hash2(block_hash), pubkey2, &self.sig2).is_ok(),
            )
        } else {
            (
                MessageSigner::verify(&self.legacy_message1(block_hash), pubkey1, &self.sig1)
                    .is_ok(),
                MessageSigner::verify(&self.legacy_message2(block_hash), pubkey2, &self.sig2)
                    .is_ok(),
            )
        };
        if ok1 && ok2 {
            Ok(())
        } else {
            Err(RegistryError::InvalidSignature)
        }
    }

    pub fn encode_with_version<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
        version: u32,
    ) -> Result<usize, io::Error> {
        let mut len = if version == LEGACY_OUTPOINT_VERSION {
            LegacyTxIn(self.outpoint1).consensus_encode(w)?
                + LegacyTxIn(self.outpoint2).consensus_encode(w)?
        } else {
            self.outpoint1.consensus_encode(w)? + self.outpoint2.consensus_encode(w)?
        };
        len += self.addr.consensus_encode(w)?;
        len += self.nonce.consensus_encode(w)?;
        len += self.block_height.consensus_encode(w)?;
        len += self.sig1.consensus_encode(w)?;
        len += self.sig2.consensus_encode(w)?;
        Ok(len)
    }

    pub fn decode_with_version<R: io::Read + ?Sized>(
        r: &mut R,
        version: u32,
    ) -> Result<Self, encode::Error> {
        let (outpoint1, outpoint2) = if version == LEGACY_OUTPOINT_VERSION {
            (LegacyTxIn::consensus_decode(r)?.0, LegacyTxIn::consensus_decode(r)?.0)
        } else {
            (OutPoint::consensus_decode(r)?, OutPoint::consensus_decode(r)?)
        };
        Ok(ServiceNodeVerification {
            outpoint1,
            outpoint2,
            addr: Decodable::consensus_decode(r)?,
            nonce: Decodable::consensus_decode(r)?,
            block_height: Decodable::consensus_decode(r)?,
            sig1: Decodable::consensus_decode(r)?,
            sig2: Decodable::consensus_decode(r)?,
        })
    }
}

impl Encodable for ServiceNodeVerification {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.encode_with_version(w, PROTOCOL_VERSION)
    }
}

impl Decodable for ServiceNodeVerification {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        ServiceNodeVerification::decode_with_version(r, PROTOCOL_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_types::Txid;
    use crate::test_utils::operator_key;
    use std::net::Ipv4Addr;

    fn sample() -> ServiceNodeVerification {
        let mut v = ServiceNodeVerification::challenge(
            NetAddress::new_ipv4(Ipv4Addr::new(5, 6, 7, 8), 12919),
            424_242,
            999,
        );
        v.outpoint1 = OutPoint::new(Txid::from_byte_array([1u8; 32]), 0);
        v.outpoint2 = OutPoint::new(Txid::from_byte_array([2u8; 32]), 1);
        v
    }

    #[test]
    fn roles() {
        let mut v = ServiceNodeVerification::challenge(NetAddress::default(), 1, 2);
        assert!(v.is_challenge());
        v.sig1 = vec![1];
        assert!(v.is_reply());
        v.sig2 = vec![2];
        assert!(!v.is_challenge() && !v.is_reply());
    }

    #[test]
    fn reply_and_broadcast_verify() {
        let block_hash = BlockHash::from_byte_array([9u8; 32]);
        let responder = operator_key(1);
        let initiator = operator_key(2);
        for new_sigs in [false, true] {
            let mut v = sample();
            v.sign_reply(&responder, &block_hash, new_sigs);
            v.verify_reply(responder.public_key(), &block_hash, new_sigs).unwrap();
            assert!(v.verify_reply(initiator.public_key(), &block_hash, new_sigs).is_err());

            v.sign_broadcast(&initiator, &block_hash, new_sigs);
            v.verify_broadcast(
                responder.public_key(),
                initiator.public_key(),
                &block_hash,
                new_sigs,
            )
            .unwrap();
            // swapped keys must fail
            assert!(v
                .verify_broadcast(
                    initiator.public_key(),
                    responder.public_key(),
                    &block_hash,
                    new_sigs
                )
                .is_err());
        }
    }

    #[test]
    fn hash_ignores_signatures() {
        let mut v = sample();
        let before = v.hash();
        v.sig1 = vec![1, 2, 3];
        v.sig2 = vec![4, 5, 6];
        assert_eq!(v.hash(), before);
        v.nonce += 1;
        assert_ne!(v.hash(), before);
    }

    #[test]
    fn wire_round_trip_both_versions() {
        let mut v = sample();
        v.sig1 = vec![7u8; 65];
        v.sig2 = vec![8u8; 65];
        for version in [LEGACY_OUTPOINT_VERSION, PROTOCOL_VERSION] {
            let mut buf = Vec::new();
            v.encode_with_version(&mut buf, version).unwrap();
            let decoded =
                ServiceNodeVerification::decode_with_version(&mut buf.as_slice(), version).unwrap();
            assert_eq!(decoded, v);
        }
    }
}
