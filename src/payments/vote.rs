//! Payment votes and the per-block payee tally.

use std::io;

use bitcoin_hashes::{sha256d, Hash};

use crate::consensus::{encode, Decodable, Encodable};
use crate::crypto::{HashSigner, MessageSigner, OperatorKeyPair};
use crate::error::PaymentError;
use crate::hash_types::VoteHash;
use crate::params::{LEGACY_OUTPOINT_VERSION, PAYMENT_VOTES_REQUIRED, PROTOCOL_VERSION};
use crate::primitives::{LegacyTxIn, OutPoint, ScriptBuf, TxOut};

fn feed<T: Encodable + ?Sized>(buf: &mut Vec<u8>, value: &T) {
    value.consensus_encode(buf).expect("in-memory writers don't error");
}

/// A signed opinion about which payee the coinbase at `block_height`
/// must pay.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaymentVote {
    pub voter_outpoint: OutPoint,
    pub block_height: i32,
    pub payee: ScriptBuf,
    pub sig: Vec<u8>,
}

impl PaymentVote {
    pub fn new(voter_outpoint: OutPoint, block_height: i32, payee: ScriptBuf) -> Self {
        PaymentVote { voter_outpoint, block_height, payee, sig: Vec::new() }
    }

    /// Canonical identity: payee first, then height, then voter. Does not
    /// match the wire serialization; the order is historical.
    pub fn hash(&self) -> VoteHash {
        let mut preimage = Vec::new();
        feed(&mut preimage, &self.payee);
        feed(&mut preimage, &self.block_height);
        feed(&mut preimage, &self.voter_outpoint);
        VoteHash::from_raw_hash(sha256d::Hash::hash(&preimage))
    }

    /// Hash signed under the new-sigs scheme: the full serialization
    /// without the signature itself.
    pub fn signature_hash(&self) -> [u8; 32] {
        let mut preimage = Vec::new();
        feed(&mut preimage, &self.voter_outpoint);
        feed(&mut preimage, &self.block_height);
        feed(&mut preimage, &self.payee);
        sha256d::Hash::hash(&preimage).to_byte_array()
    }

    fn legacy_message(&self) -> String {
        format!(
            "{}{}{}",
            self.voter_outpoint.to_short_string(),
            self.block_height,
            self.payee.to_asm_string()
        )
    }

    pub fn sign(&mut self, key: &OperatorKeyPair, new_sigs: bool) {
        self.sig = if new_sigs {
            HashSigner::sign(self.signature_hash(), key)
        } else {
            MessageSigner::sign(&self.legacy_message(), key)
        };
    }

    /// Verify against the voter's operator key. `ban_on_failure` is set
    /// for fresh votes after sync; stale votes may be signed with a key we
    /// no longer know about.
    pub fn check_signature(
        &self,
        pubkey: &crate::primitives::PubKey,
        new_sigs: bool,
        ban_on_failure: bool,
    ) -> Result<(), PaymentError> {
        if new_sigs {
            if HashSigner::verify(self.signature_hash(), pubkey, &self.sig).is_ok() {
                return Ok(());
            }
            // could be a signature in the old format
        }
        MessageSigner::verify(&self.legacy_message(), pubkey, &self.sig)
            .map_err(|_| PaymentError::InvalidSignature { banable: ban_on_failure })
    }

    pub fn is_verified(&self) -> bool {
        !self.sig.is_empty()
    }

    pub fn mark_as_not_verified(&mut self) {
        self.sig.clear();
    }

    pub fn encode_with_version<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
        version: u32,
    ) -> Result<usize, io::Error> {
        let mut len = if version == LEGACY_OUTPOINT_VERSION {
            LegacyTxIn(self.voter_outpoint).consensus_encode(w)?
        } else {
            self.voter_outpoint.consensus_encode(w)?
        };
        len += self.block_height.consensus_encode(w)?;
        len += self.payee.consensus_encode(w)?;
        len += self.sig.consensus_encode(w)?;
        Ok(len)
    }

    pub fn decode_with_version<R: io::Read + ?Sized>(
        r: &mut R,
        version: u32,
    ) -> Result<Self, encode::Error> {
        let voter_outpoint = if version == LEGACY_OUTPOINT_VERSION {
            LegacyTxIn::consensus_decode(r)?.0
        } else {
            OutPoint::consensus_decode(r)?
        };
        Ok(PaymentVote {
            voter_outpoint,
            block_height: Decodable::consensus_decode(r)?,
            payee: Decodable::consensus_decode(r)?,
            sig: Decodable::consensus_decode(r)?,
        })
    }
}

impl Encodable for PaymentVote {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.encode_with_version(w, PROTOCOL_VERSION)
    }
}

impl Decodable for PaymentVote {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        PaymentVote::decode_with_version(r, PROTOCOL_VERSION)
    }
}

/// One payee candidate and the votes backing it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payee {
    script: ScriptBuf,
    vote_hashes: Vec<VoteHash>,
}

impl Payee {
    pub fn new(script: ScriptBuf, first_vote: VoteHash) -> Self {
        Payee { script, vote_hashes: vec![first_vote] }
    }

    pub fn script(&self) -> &ScriptBuf {
        &self.script
    }

    pub fn add_vote_hash(&mut self, hash: VoteHash) {
        self.vote_hashes.push(hash);
    }

    pub fn vote_hashes(&self) -> &[VoteHash] {
        &self.vote_hashes
    }

    pub fn vote_count(&self) -> usize {
        self.vote_hashes.len()
    }
}

impl Encodable for Payee {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.script.consensus_encode(w)? + self.vote_hashes.consensus_encode(w)?)
    }
}

impl Decodable for Payee {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Payee {
            script: Decodable::consensus_decode(r)?,
            vote_hashes: Decodable::consensus_decode(r)?,
        })
    }
}

/// Vote tally for one block height.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockPayees {
    pub block_height: i32,
    pub payees: Vec<Payee>,
}

impl BlockPayees {
    pub fn new(block_height: i32) -> Self {
        BlockPayees { block_height, payees: Vec::new() }
    }

    pub fn add_payee(&mut self, vote: &PaymentVote) {
        let vote_hash = vote.hash();
        for payee in &mut self.payees {
            if payee.script == vote.payee {
                payee.add_vote_hash(vote_hash);
                return;
            }
        }
        self.payees.push(Payee::new(vote.payee.clone(), vote_hash));
    }

    /// The candidate with the most votes, if any.
    pub fn best_payee(&self) -> Option<&ScriptBuf> {
        self.payees.iter().max_by_key(|payee| payee.vote_count()).map(|payee| &payee.script)
    }

    pub fn has_payee_with_votes(&self, script: &ScriptBuf, required: usize) -> bool {
        self.payees.iter().any(|p| p.vote_count() >= required && p.script == *script)
    }

    pub fn max_signatures(&self) -> usize {
        self.payees.iter().map(|p| p.vote_count()).max().unwrap_or(0)
    }

    /// Check a coinbase against the tally. With no candidate at quorum
    /// there is not enough data to reject anything.
    pub fn is_transaction_valid(&self, outputs: &[TxOut], expected_payment: i64) -> bool {
        if self.max_signatures() < PAYMENT_VOTES_REQUIRED {
            return true;
        }

        let mut possible_payees = Vec::new();
        for payee in &self.payees {
            if payee.vote_count() < PAYMENT_VOTES_REQUIRED {
                continue;
            }
            if outputs
                .iter()
                .any(|out| out.script_pubkey == payee.script && out.value == expected_payment)
            {
                return true;
            }
            possible_payees.push(payee.script.to_asm_string());
        }

        tracing::warn!(target: "payments", height = self.block_height,
            possible = %possible_payees.join(","), amount = expected_payment,
            "coinbase is missing the required service-node payment");
        false
    }

    pub fn required_payments_string(&self) -> String {
        if self.payees.is_empty() {
            return "Unknown".to_string();
        }
        self.payees
            .iter()
            .map(|p| format!("{}:{}", p.script.to_asm_string(), p.vote_count()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Encodable for BlockPayees {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.block_height.consensus_encode(w)? + self.payees.consensus_encode(w)?)
    }
}

impl Decodable for BlockPayees {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(BlockPayees {
            block_height: Decodable::consensus_decode(r)?,
            payees: Decodable::consensus_decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_types::{KeyId, Txid};
    use crate::test_utils::operator_key;

    fn vote(voter: u8, height: i32, payee_byte: u8) -> PaymentVote {
        PaymentVote::new(
            OutPoint::new(Txid::from_byte_array([voter; 32]), 0),
            height,
            ScriptBuf::new_p2pkh(&KeyId::from_byte_array([payee_byte; 20])),
        )
    }

    #[test]
    fn vote_hash_is_identity() {
        let a = vote(1, 100, 9);
        let mut b = a.clone();
        b.sig = vec![1, 2, 3];
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), vote(2, 100, 9).hash());
        assert_ne!(a.hash(), vote(1, 101, 9).hash());
        assert_ne!(a.hash(), vote(1, 100, 8).hash());
    }

    #[test]
    fn vote_sign_verify_both_schemes() {
        let key = operator_key(5);
        for new_sigs in [false, true] {
            let mut v = vote(1, 100, 9);
            v.sign(&key, new_sigs);
            assert!(v.is_verified());
            v.check_signature(key.public_key(), new_sigs, true).unwrap();
            if !new_sigs {
                // old signatures stay acceptable after the flag flips
                v.check_signature(key.public_key(), true, true).unwrap();
            }
            let other = operator_key(6);
            let err = v.check_signature(other.public_key(), new_sigs, true).unwrap_err();
            assert_eq!(err, PaymentError::InvalidSignature { banable: true });
            let soft = v.check_signature(other.public_key(), new_sigs, false).unwrap_err();
            assert_eq!(soft.dos_score(), 0);
        }
    }

    #[test]
    fn vote_wire_round_trip_both_versions() {
        let mut v = vote(1, 100, 9);
        v.sign(&operator_key(5), true);
        for version in [LEGACY_OUTPOINT_VERSION, PROTOCOL_VERSION] {
            let mut buf = Vec::new();
            v.encode_with_version(&mut buf, version).unwrap();
            let decoded = PaymentVote::decode_with_version(&mut buf.as_slice(), version).unwrap();
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn tally_accumulates_per_payee() {
        let mut payees = BlockPayees::new(100);
        for voter in 1..=7u8 {
            payees.add_payee(&vote(voter, 100, 1));
        }
        payees.add_payee(&vote(8, 100, 2));
        assert_eq!(payees.max_signatures(), 7);
        assert_eq!(payees.best_payee(), Some(&vote(1, 100, 1).payee));
        assert!(payees.has_payee_with_votes(&vote(1, 100, 1).payee, 6));
        assert!(!payees.has_payee_with_votes(&vote(8, 100, 2).payee, 2));
    }

    #[test]
    fn coinbase_validation_against_quorum() {
        let mut payees = BlockPayees::new(100);
        for voter in 1..=6u8 {
            payees.add_payee(&vote(voter, 100, 1));
        }
        payees.add_payee(&vote(7, 100, 2));

        let winner = vote(1, 100, 1).payee;
        let loser = vote(7, 100, 2).payee;
        let pay = |script: &ScriptBuf, value| TxOut { value, script_pubkey: script.clone() };

        assert!(payees.is_transaction_valid(&[pay(&winner, 500)], 500));
        // wrong amount
        assert!(!payees.is_transaction_valid(&[pay(&winner, 499)], 500));
        // wrong payee
        assert!(!payees.is_transaction_valid(&[pay(&loser, 500)], 500));
    }

    #[test]
    fn coinbase_accepted_without_quorum() {
        let mut payees = BlockPayees::new(100);
        for voter in 1..=5u8 {
            payees.add_payee(&vote(voter, 100, 1));
        }
        // 5 < PAYMENT_VOTES_REQUIRED: any coinbase goes
        assert!(payees.is_transaction_valid(&[], 500));
    }

    #[test]
    fn block_payees_encoding_round_trip() {
        let mut payees = BlockPayees::new(77);
        payees.add_payee(&vote(1, 77, 1));
        payees.add_payee(&vote(2, 77, 1));
        payees.add_payee(&vote(3, 77, 2));
        let encoded = crate::consensus::serialize(&payees);
        let decoded: BlockPayees = crate::consensus::deserialize(&encoded).unwrap();
        assert_eq!(decoded, payees);
    }
}
