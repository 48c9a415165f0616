//! The two coexisting signature schemes.
//!
//! `MessageSigner` is the legacy scheme: a compact recoverable signature
//! over sha256d(varint-prefixed magic ++ varint-prefixed message string).
//! `HashSigner` signs a canonical message hash directly. Peers running
//! older software verify these signatures, so both representations must
//! stay byte-for-byte stable.

use bitcoin_hashes::{sha256d, Hash};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, SecretKey, SECP256K1};
use thiserror::Error;

use crate::consensus::{Encodable, VarInt};
use crate::primitives::PubKey;

/// Magic prefix of the legacy string scheme.
pub const MESSAGE_MAGIC: &str = "DarkCoin Signed Message:\n";

/// Compact signature length: recovery header plus (r, s).
const COMPACT_SIG_LEN: usize = 65;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("signature has wrong length")]
    BadLength,

    #[error("signature carries an invalid recovery header")]
    BadRecoveryId,

    #[error("public key recovery failed")]
    RecoveryFailed,

    #[error("recovered key does not match the expected key")]
    KeyIdMismatch,

    #[error("secp256k1 error: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// An operator (or collateral) keypair held by the local node.
#[derive(Clone)]
pub struct OperatorKeyPair {
    secret: SecretKey,
    public: PubKey,
    compressed: bool,
}

impl OperatorKeyPair {
    pub fn from_secret_bytes(bytes: &[u8; 32], compressed: bool) -> Result<Self, SignerError> {
        let secret = SecretKey::from_slice(bytes)?;
        let public =
            PubKey::from_secp(&secp256k1::PublicKey::from_secret_key(SECP256K1, &secret), compressed);
        Ok(OperatorKeyPair { secret, public, compressed })
    }

    pub fn public_key(&self) -> &PubKey {
        &self.public
    }

    fn sign_digest(&self, digest: [u8; 32]) -> Vec<u8> {
        let message = Message::from_digest(digest);
        let sig: RecoverableSignature = SECP256K1.sign_ecdsa_recoverable(&message, &self.secret);
        let (rec_id, data) = sig.serialize_compact();
        let mut out = Vec::with_capacity(COMPACT_SIG_LEN);
        out.push(27 + rec_id.to_i32() as u8 + if self.compressed { 4 } else { 0 });
        out.extend_from_slice(&data);
        out
    }
}

fn recover_digest(digest: [u8; 32], sig: &[u8]) -> Result<PubKey, SignerError> {
    if sig.len() != COMPACT_SIG_LEN {
        return Err(SignerError::BadLength);
    }
    let header = sig[0];
    if !(27..27 + 8).contains(&header) {
        return Err(SignerError::BadRecoveryId);
    }
    let compressed = (header - 27) & 4 != 0;
    let rec_id = RecoveryId::from_i32(((header - 27) & 3) as i32)
        .map_err(|_| SignerError::BadRecoveryId)?;
    let recoverable = RecoverableSignature::from_compact(&sig[1..], rec_id)
        .map_err(|_| SignerError::BadRecoveryId)?;
    let message = Message::from_digest(digest);
    let recovered =
        SECP256K1.recover_ecdsa(&message, &recoverable).map_err(|_| SignerError::RecoveryFailed)?;
    Ok(PubKey::from_secp(&recovered, compressed))
}

fn verify_digest(digest: [u8; 32], pubkey: &PubKey, sig: &[u8]) -> Result<(), SignerError> {
    let recovered = recover_digest(digest, sig)?;
    if recovered.key_id() != pubkey.key_id() {
        return Err(SignerError::KeyIdMismatch);
    }
    Ok(())
}

/// The legacy string scheme.
pub struct MessageSigner;

impl MessageSigner {
    /// sha256d over the magic and the message, both varint-length
    /// prefixed.
    pub fn message_digest(message: &str) -> [u8; 32] {
        let mut preimage = Vec::new();
        write_prefixed(&mut preimage, MESSAGE_MAGIC.as_bytes());
        write_prefixed(&mut preimage, message.as_bytes());
        sha256d::Hash::hash(&preimage).to_byte_array()
    }

    pub fn sign(message: &str, key: &OperatorKeyPair) -> Vec<u8> {
        key.sign_digest(Self::message_digest(message))
    }

    pub fn verify(message: &str, pubkey: &PubKey, sig: &[u8]) -> Result<(), SignerError> {
        verify_digest(Self::message_digest(message), pubkey, sig)
    }
}

/// The hash scheme active once the new-sigs flag is published.
pub struct HashSigner;

impl HashSigner {
    pub fn sign(digest: [u8; 32], key: &OperatorKeyPair) -> Vec<u8> {
        key.sign_digest(digest)
    }

    pub fn verify(digest: [u8; 32], pubkey: &PubKey, sig: &[u8]) -> Result<(), SignerError> {
        verify_digest(digest, pubkey, sig)
    }
}

fn write_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    VarInt(bytes.len() as u64).consensus_encode(buf).expect("in-memory writers don't error");
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8, compressed: bool) -> OperatorKeyPair {
        OperatorKeyPair::from_secret_bytes(&[byte; 32], compressed).unwrap()
    }

    #[test]
    fn message_sign_verify_round_trip() {
        let key = key(0x11, true);
        let sig = MessageSigner::sign("hello", &key);
        assert_eq!(sig.len(), COMPACT_SIG_LEN);
        MessageSigner::verify("hello", key.public_key(), &sig).unwrap();
        assert_eq!(
            MessageSigner::verify("goodbye", key.public_key(), &sig),
            Err(SignerError::KeyIdMismatch)
        );
    }

    #[test]
    fn uncompressed_keys_verify_too() {
        let key = key(0x22, false);
        let sig = MessageSigner::sign("msg", &key);
        assert_eq!((sig[0] - 27) & 4, 0);
        MessageSigner::verify("msg", key.public_key(), &sig).unwrap();
    }

    #[test]
    fn hash_sign_verify_round_trip() {
        let key = key(0x33, true);
        let digest = [7u8; 32];
        let sig = HashSigner::sign(digest, &key);
        HashSigner::verify(digest, key.public_key(), &sig).unwrap();
        assert_eq!(
            HashSigner::verify([8u8; 32], key.public_key(), &sig),
            Err(SignerError::KeyIdMismatch)
        );
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = key(0x44, true);
        let other = key(0x55, true);
        let sig = HashSigner::sign([1u8; 32], &signer);
        assert_eq!(
            HashSigner::verify([1u8; 32], other.public_key(), &sig),
            Err(SignerError::KeyIdMismatch)
        );
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let signer = key(0x66, true);
        let sig = HashSigner::sign([1u8; 32], &signer);
        assert_eq!(
            HashSigner::verify([1u8; 32], signer.public_key(), &sig[..64]),
            Err(SignerError::BadLength)
        );
    }

    #[test]
    fn schemes_produce_different_digests() {
        // the hash scheme must not be a re-labeling of the string scheme
        let digest = MessageSigner::message_digest("abc");
        assert_ne!(digest, sha256d::Hash::hash(b"abc").to_byte_array());
    }
}
