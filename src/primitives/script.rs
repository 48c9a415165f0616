//! The minimal script support the payment subsystem needs: P2PKH
//! construction, recognition and the asm rendering embedded in legacy vote
//! signatures.

use std::fmt;
use std::io;

use bitcoin_hashes::Hash;

use crate::consensus::{encode, Decodable, Encodable};
use crate::hash_types::KeyId;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xA9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xAC;

/// An owned script. Payee scripts in this subsystem are always the
/// 25-byte pay-to-pubkey-hash form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ScriptBuf(Vec<u8>);

impl ScriptBuf {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ScriptBuf(bytes)
    }

    /// Standard pay-to-pubkey-hash locking script for a key id.
    pub fn new_p2pkh(key_id: &KeyId) -> Self {
        let mut script = Vec::with_capacity(25);
        script.push(OP_DUP);
        script.push(OP_HASH160);
        script.push(20);
        script.extend_from_slice(&key_id.to_byte_array());
        script.push(OP_EQUALVERIFY);
        script.push(OP_CHECKSIG);
        ScriptBuf(script)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_p2pkh(&self) -> bool {
        self.0.len() == 25
            && self.0[0] == OP_DUP
            && self.0[1] == OP_HASH160
            && self.0[2] == 20
            && self.0[23] == OP_EQUALVERIFY
            && self.0[24] == OP_CHECKSIG
    }

    pub fn p2pkh_key_id(&self) -> Option<KeyId> {
        if self.is_p2pkh() {
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&self.0[3..23]);
            Some(KeyId::from_byte_array(bytes))
        } else {
            None
        }
    }

    /// The asm rendering the reference client feeds into legacy vote
    /// signature strings. Only the P2PKH shape is rendered symbolically;
    /// anything else falls back to plain hex, which this subsystem never
    /// produces itself.
    pub fn to_asm_string(&self) -> String {
        if self.is_p2pkh() {
            format!("OP_DUP OP_HASH160 {} OP_EQUALVERIFY OP_CHECKSIG", hex::encode(&self.0[3..23]))
        } else {
            hex::encode(&self.0)
        }
    }
}

impl fmt::Display for ScriptBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Encodable for ScriptBuf {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(w)
    }
}

impl Decodable for ScriptBuf {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(ScriptBuf(Vec::<u8>::consensus_decode(r)?))
    }
}
