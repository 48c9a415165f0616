//! Public keys as the wire carries them: raw serialized bytes with a
//! compact-size prefix, validated only when actually used.

use std::io;

use bitcoin_hashes::{hash160, Hash, HashEngine};

use crate::consensus::{encode, Decodable, Encodable};
use crate::hash_types::KeyId;

/// A serialized secp256k1 public key, compressed (33 bytes) or legacy
/// uncompressed (65 bytes). A default-constructed key is empty and invalid,
/// which the announce checks rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PubKey(Vec<u8>);

impl PubKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        PubKey(bytes)
    }

    pub fn from_secp(key: &secp256k1::PublicKey, compressed: bool) -> Self {
        if compressed {
            PubKey(key.serialize().to_vec())
        } else {
            PubKey(key.serialize_uncompressed().to_vec())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_valid_size(&self) -> bool {
        matches!(self.0.len(), 33 | 65)
    }

    pub fn is_compressed(&self) -> bool {
        self.0.len() == 33
    }

    /// Hash160 of the serialized key, the payee identity everywhere in
    /// this subsystem.
    pub fn key_id(&self) -> KeyId {
        let mut engine = hash160::Hash::engine();
        engine.input(&self.0);
        KeyId::from_raw_hash(hash160::Hash::from_engine(engine))
    }

    pub fn to_secp(&self) -> Result<secp256k1::PublicKey, secp256k1::Error> {
        secp256k1::PublicKey::from_slice(&self.0)
    }
}

impl Encodable for PubKey {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for PubKey {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(PubKey(Vec::<u8>::consensus_decode(r)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> secp256k1::PublicKey {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        secp256k1::PublicKey::from_secret_key(&secp, &sk)
    }

    #[test]
    fn sizes() {
        let key = test_key();
        assert!(PubKey::from_secp(&key, true).is_compressed());
        assert!(PubKey::from_secp(&key, true).is_valid_size());
        assert!(PubKey::from_secp(&key, false).is_valid_size());
        assert!(!PubKey::from_secp(&key, false).is_compressed());
        assert!(!PubKey::default().is_valid_size());
        assert!(PubKey::default().is_empty());
    }

    #[test]
    fn key_id_differs_by_encoding() {
        let key = test_key();
        // hash160 covers the serialized bytes, so the two encodings have
        // distinct ids, exactly like the reference client
        assert_ne!(PubKey::from_secp(&key, true).key_id(), PubKey::from_secp(&key, false).key_id());
    }

    #[test]
    fn encoding_round_trip() {
        let pk = PubKey::from_secp(&test_key(), true);
        let encoded = crate::consensus::serialize(&pk);
        assert_eq!(encoded.len(), 34);
        let decoded: PubKey = crate::consensus::deserialize(&encoded).unwrap();
        assert_eq!(decoded, pk);
    }
}
