//! Announce and ping gossip messages.
//!
//! Several canonical hashes here deliberately do not match the wire
//! serialization; the dummy pad bytes after the outpoint reproduce the
//! historical hashing layout that deployed peers still verify.

use std::io;

use bitcoin_hashes::{sha256d, Hash};

use crate::chain::ChainAdapter;
use crate::consensus::{encode, Decodable, Encodable};
use crate::crypto::{HashSigner, MessageSigner, OperatorKeyPair};
use crate::error::RegistryError;
use crate::hash_types::{hash_hex, key_id_hex, AnnounceHash, BlockHash, PingHash};
use crate::params::{
    Network, CLIENT_VERSION, DEFAULT_DAEMON_VERSION, DEFAULT_SENTINEL_VERSION,
    LEGACY_OUTPOINT_VERSION, NEW_START_REQUIRED_SECONDS, PROTOCOL_VERSION,
};
use crate::primitives::{LegacyTxIn, NetAddress, OutPoint, PubKey};
use crate::registry::node::ServiceNodeState;

/// Number of blocks below the tip a ping anchors to.
pub const PING_BLOCK_DEPTH: i32 = 12;

/// How far behind the tip a ping's anchor block may fall before the ping
/// is discarded.
pub const PING_MAX_BLOCK_AGE: i32 = 24;

/// Acceptable clock skew into the future for signature times.
pub const MAX_FUTURE_SIG_TIME: i64 = 60 * 60;

fn feed<T: Encodable + ?Sized>(buf: &mut Vec<u8>, value: &T) {
    value.consensus_encode(buf).expect("in-memory writers don't error");
}

/// Periodic liveness proof signed by the operator key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNodePing {
    pub outpoint: OutPoint,
    pub block_hash: BlockHash,
    pub sig_time: i64,
    pub sig: Vec<u8>,
    pub sentinel_is_current: bool,
    pub sentinel_version: u32,
    pub daemon_version: u32,
}

impl Default for ServiceNodePing {
    fn default() -> Self {
        ServiceNodePing {
            outpoint: OutPoint::default(),
            block_hash: BlockHash::from_byte_array([0u8; 32]),
            sig_time: 0,
            sig: Vec::new(),
            sentinel_is_current: false,
            sentinel_version: DEFAULT_SENTINEL_VERSION,
            daemon_version: DEFAULT_DAEMON_VERSION,
        }
    }
}

impl ServiceNodePing {
    /// A fresh unsigned ping anchored `PING_BLOCK_DEPTH` blocks below the
    /// tip. `None` until the chain is long enough.
    pub fn new(outpoint: OutPoint, chain: &dyn ChainAdapter) -> Option<Self> {
        let tip = chain.tip_height();
        if tip < PING_BLOCK_DEPTH {
            return None;
        }
        Some(ServiceNodePing {
            outpoint,
            block_hash: chain.block_hash(tip - PING_BLOCK_DEPTH)?,
            sig_time: chain.adjusted_time(),
            daemon_version: CLIENT_VERSION,
            ..Default::default()
        })
    }

    pub fn is_null(&self) -> bool {
        *self == ServiceNodePing::default()
    }

    /// Canonical hash; layout depends on the new-sigs flag.
    pub fn hash(&self, new_sigs: bool) -> PingHash {
        let mut preimage = Vec::new();
        if new_sigs {
            feed(&mut preimage, &self.outpoint);
            feed(&mut preimage, &self.block_hash);
            feed(&mut preimage, &self.sig_time);
            feed(&mut preimage, &self.sentinel_is_current);
            feed(&mut preimage, &self.sentinel_version);
            feed(&mut preimage, &self.daemon_version);
        } else {
            // dummy pad to match the old hashing format
            feed(&mut preimage, &self.outpoint);
            feed(&mut preimage, &0u8);
            feed(&mut preimage, &0xFFFF_FFFFu32);
            feed(&mut preimage, &self.sig_time);
        }
        PingHash::from_raw_hash(sha256d::Hash::hash(&preimage))
    }

    fn legacy_message(&self) -> String {
        format!(
            "{}{}{}",
            crate::primitives::outpoint::legacy_txin_string(&self.outpoint),
            hash_hex(&self.block_hash.to_byte_array()),
            self.sig_time
        )
    }

    pub fn sign(&mut self, key: &OperatorKeyPair, new_sigs: bool, adjusted_time: i64) {
        self.sig_time = adjusted_time;
        self.sig = if new_sigs {
            HashSigner::sign(self.hash(true).to_byte_array(), key)
        } else {
            MessageSigner::sign(&self.legacy_message(), key)
        };
    }

    pub fn verify(&self, pubkey: &PubKey, new_sigs: bool) -> Result<(), RegistryError> {
        if new_sigs {
            if HashSigner::verify(self.hash(true).to_byte_array(), pubkey, &self.sig).is_ok() {
                return Ok(());
            }
            // maybe it's in the old format
        }
        MessageSigner::verify(&self.legacy_message(), pubkey, &self.sig)
            .map_err(|_| RegistryError::InvalidPingSignature)
    }

    /// Stateless sanity: sig_time not too far in the future, anchor block
    /// known to our chain view.
    pub fn simple_check(&self, chain: &dyn ChainAdapter) -> Result<(), RegistryError> {
        if self.sig_time > chain.adjusted_time() + MAX_FUTURE_SIG_TIME {
            return Err(RegistryError::SigTimeFromFuture);
        }
        if chain.height_of(&self.block_hash).is_none() {
            // we may be stuck or forked, no reason to punish the sender
            return Err(RegistryError::UnknownBlockHash);
        }
        Ok(())
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.sig_time > NEW_START_REQUIRED_SECONDS
    }

    pub fn encode_with_version<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
        version: u32,
    ) -> Result<usize, io::Error> {
        let mut len = if version == LEGACY_OUTPOINT_VERSION {
            LegacyTxIn(self.outpoint).consensus_encode(w)?
        } else {
            self.outpoint.consensus_encode(w)?
        };
        len += self.block_hash.consensus_encode(w)?;
        len += self.sig_time.consensus_encode(w)?;
        len += self.sig.consensus_encode(w)?;
        len += self.sentinel_is_current.consensus_encode(w)?;
        len += self.sentinel_version.consensus_encode(w)?;
        if version != LEGACY_OUTPOINT_VERSION {
            len += self.daemon_version.consensus_encode(w)?;
        }
        Ok(len)
    }

    pub fn decode_with_version<R: io::Read + ?Sized>(
        r: &mut R,
        version: u32,
    ) -> Result<Self, encode::Error> {
        let outpoint = if version == LEGACY_OUTPOINT_VERSION {
            LegacyTxIn::consensus_decode(r)?.0
        } else {
            OutPoint::consensus_decode(r)?
        };
        let block_hash = BlockHash::consensus_decode(r)?;
        let sig_time = i64::consensus_decode(r)?;
        let sig = Vec::<u8>::consensus_decode(r)?;
        let mut ping = ServiceNodePing {
            outpoint,
            block_hash,
            sig_time,
            sig,
            ..Default::default()
        };
        // peers mid-migration may truncate here
        match bool::consensus_decode(r) {
            Ok(flag) => ping.sentinel_is_current = flag,
            Err(encode::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(ping)
            }
            Err(e) => return Err(e),
        }
        ping.sentinel_version = u32::consensus_decode(r)?;
        if version != LEGACY_OUTPOINT_VERSION {
            match u32::consensus_decode(r) {
                Ok(v) => ping.daemon_version = v,
                Err(encode::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(ping)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ping)
    }
}

impl Encodable for ServiceNodePing {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.encode_with_version(w, PROTOCOL_VERSION)
    }
}

impl Decodable for ServiceNodePing {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        ServiceNodePing::decode_with_version(r, PROTOCOL_VERSION)
    }
}

/// Self-introduction message signed by the collateral key, carrying the
/// first ping inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNodeAnnounce {
    pub outpoint: OutPoint,
    pub addr: NetAddress,
    pub pubkey_collateral: PubKey,
    pub pubkey_operator: PubKey,
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: u32,
    pub last_ping: ServiceNodePing,
    /// Set when this announce re-enters processing as a recovery reply;
    /// never serialized.
    pub recovery: bool,
    /// State the node starts in when the announce is accepted; adjusted by
    /// `simple_check`. Never serialized to the wire.
    pub initial_state: ServiceNodeState,
}

impl ServiceNodeAnnounce {
    pub fn new(
        outpoint: OutPoint,
        addr: NetAddress,
        pubkey_collateral: PubKey,
        pubkey_operator: PubKey,
        protocol_version: u32,
    ) -> Self {
        ServiceNodeAnnounce {
            outpoint,
            addr,
            pubkey_collateral,
            pubkey_operator,
            sig: Vec::new(),
            sig_time: 0,
            protocol_version,
            last_ping: ServiceNodePing::default(),
            recovery: false,
            initial_state: ServiceNodeState::Enabled,
        }
    }

    /// Unique identity of the announce. The layout keeps the historical
    /// dummy pad and covers only outpoint, collateral key and time.
    pub fn hash(&self) -> AnnounceHash {
        let mut preimage = Vec::new();
        feed(&mut preimage, &self.outpoint);
        feed(&mut preimage, &0u8);
        feed(&mut preimage, &0xFFFF_FFFFu32);
        feed(&mut preimage, &self.pubkey_collateral);
        feed(&mut preimage, &self.sig_time);
        AnnounceHash::from_raw_hash(sha256d::Hash::hash(&preimage))
    }

    /// Hash signed under the new-sigs scheme.
    pub fn signature_hash(&self) -> [u8; 32] {
        let mut preimage = Vec::new();
        feed(&mut preimage, &self.outpoint);
        feed(&mut preimage, &self.addr);
        feed(&mut preimage, &self.pubkey_collateral);
        feed(&mut preimage, &self.pubkey_operator);
        feed(&mut preimage, &self.sig_time);
        feed(&mut preimage, &(self.protocol_version as i32));
        sha256d::Hash::hash(&preimage).to_byte_array()
    }

    fn legacy_message(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr.to_ip_port_string(),
            self.sig_time,
            key_id_hex(&self.pubkey_collateral.key_id()),
            key_id_hex(&self.pubkey_operator.key_id()),
            self.protocol_version
        )
    }

    pub fn sign(&mut self, collateral_key: &OperatorKeyPair, new_sigs: bool, adjusted_time: i64) {
        self.sig_time = adjusted_time;
        self.sig = if new_sigs {
            HashSigner::sign(self.signature_hash(), collateral_key)
        } else {
            MessageSigner::sign(&self.legacy_message(), collateral_key)
        };
    }

    pub fn verify_signature(&self, new_sigs: bool) -> Result<(), RegistryError> {
        if new_sigs {
            if HashSigner::verify(self.signature_hash(), &self.pubkey_collateral, &self.sig).is_ok()
            {
                return Ok(());
            }
            // maybe it's in the old format
        }
        MessageSigner::verify(&self.legacy_message(), &self.pubkey_collateral, &self.sig)
            .map_err(|_| RegistryError::InvalidSignature)
    }

    /// Stateless checks; may downgrade `initial_state` instead of
    /// rejecting when the embedded ping is broken or the protocol is old.
    pub fn simple_check(
        &mut self,
        chain: &dyn ChainAdapter,
        network: Network,
        min_payment_proto: u32,
    ) -> Result<(), RegistryError> {
        if !crate::registry::node::ServiceNode::addr_is_valid(&self.addr, network) {
            return Err(RegistryError::InvalidAddress);
        }

        if self.sig_time > chain.adjusted_time() + MAX_FUTURE_SIG_TIME {
            return Err(RegistryError::SigTimeFromFuture);
        }

        // empty ping or incorrect sigTime/unknown blockhash: one of us is
        // probably forked, mark expired and keep checking the rest
        if self.last_ping.is_null() || self.last_ping.simple_check(chain).is_err() {
            self.initial_state = ServiceNodeState::Expired;
        }

        if self.protocol_version < min_payment_proto {
            self.initial_state = ServiceNodeState::UpdateRequired;
        }

        if !self.pubkey_collateral.is_valid_size() {
            return Err(RegistryError::Malformed("collateral pubkey script has the wrong size"));
        }
        if !self.pubkey_operator.is_valid_size() {
            return Err(RegistryError::Malformed("operator pubkey script has the wrong size"));
        }

        let mainnet_port = Network::Mainnet.default_port();
        if network.is_mainnet() {
            if self.addr.port() != mainnet_port {
                return Err(RegistryError::WrongPort);
            }
        } else if self.addr.port() == mainnet_port {
            return Err(RegistryError::WrongPort);
        }

        Ok(())
    }

    /// Resolve the collateral and pin the hash of the block where it
    /// reached the confirmation threshold. Returns that block hash.
    pub fn check_outpoint(
        &self,
        chain: &dyn ChainAdapter,
        min_confirmations: i32,
    ) -> Result<BlockHash, RegistryError> {
        let coin = chain.utxo(&self.outpoint).ok_or(RegistryError::CollateralMissing)?;
        if coin.value != crate::params::MAGIC_COLLATERAL_AMOUNT {
            return Err(RegistryError::CollateralWrongAmount);
        }
        if chain.tip_height() - coin.height + 1 < min_confirmations {
            // legit but shallow; the announce will be retried later
            return Err(RegistryError::CollateralTooNew);
        }

        // sig time must not predate the block where the collateral became
        // buried deep enough; block timestamps are only roughly correct
        let conf_height = coin.height + min_confirmations - 1;
        let conf_time = chain.block_time(conf_height).ok_or(RegistryError::UnknownHeight)?;
        if conf_time > self.sig_time {
            return Err(RegistryError::SigTimeBeforeConfirmation);
        }

        chain.block_hash(conf_height).ok_or(RegistryError::UnknownHeight)
    }

    pub fn encode_with_version<W: io::Write + ?Sized>(
        &self,
        w: &mut W,
        version: u32,
    ) -> Result<usize, io::Error> {
        let mut len = if version == LEGACY_OUTPOINT_VERSION {
            LegacyTxIn(self.outpoint).consensus_encode(w)?
        } else {
            self.outpoint.consensus_encode(w)?
        };
        len += self.addr.consensus_encode(w)?;
        len += self.pubkey_collateral.consensus_encode(w)?;
        len += self.pubkey_operator.consensus_encode(w)?;
        len += self.sig.consensus_encode(w)?;
        len += self.sig_time.consensus_encode(w)?;
        len += (self.protocol_version as i32).consensus_encode(w)?;
        len += self.last_ping.encode_with_version(w, version)?;
        Ok(len)
    }

    pub fn decode_with_version<R: io::Read + ?Sized>(
        r: &mut R,
        version: u32,
    ) -> Result<Self, encode::Error> {
        let outpoint = if version == LEGACY_OUTPOINT_VERSION {
            LegacyTxIn::consensus_decode(r)?.0
        } else {
            OutPoint::consensus_decode(r)?
        };
        Ok(ServiceNodeAnnounce {
            outpoint,
            addr: Decodable::consensus_decode(r)?,
            pubkey_collateral: Decodable::consensus_decode(r)?,
            pubkey_operator: Decodable::consensus_decode(r)?,
            sig: Decodable::consensus_decode(r)?,
            sig_time: Decodable::consensus_decode(r)?,
            protocol_version: i32::consensus_decode(r)? as u32,
            last_ping: ServiceNodePing::decode_with_version(r, version)?,
            recovery: false,
            initial_state: ServiceNodeState::Enabled,
        })
    }
}

impl Encodable for ServiceNodeAnnounce {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        self.encode_with_version(w, PROTOCOL_VERSION)
    }
}

impl Decodable for ServiceNodeAnnounce {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        ServiceNodeAnnounce::decode_with_version(r, PROTOCOL_VERSION)
    }
}
