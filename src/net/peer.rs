//! Peer handles and inventory types.
//!
//! The core never iterates live connection state; the bus hands out a
//! snapshot of peer handles and all sends are fire-and-forget. Misbehavior
//! scores flow back through the handle into whatever ban manager the
//! surrounding node runs.

use std::io;
use std::sync::Arc;

use crate::consensus::{encode, Decodable, Encodable};
use crate::net::message::Message;
use crate::primitives::NetAddress;

/// Inventory object kinds relayed by this subsystem. The numeric tags are
/// fixed by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InvKind {
    PaymentVote = 7,
    PaymentBlock = 8,
    Announce = 14,
    Ping = 15,
    Verify = 19,
}

impl InvKind {
    pub fn from_u32(value: u32) -> Option<InvKind> {
        match value {
            7 => Some(InvKind::PaymentVote),
            8 => Some(InvKind::PaymentBlock),
            14 => Some(InvKind::Announce),
            15 => Some(InvKind::Ping),
            19 => Some(InvKind::Verify),
            _ => None,
        }
    }
}

/// An inventory vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inv {
    pub kind: u32,
    pub hash: [u8; 32],
}

impl Inv {
    pub fn new(kind: InvKind, hash: [u8; 32]) -> Self {
        Inv { kind: kind as u32, hash }
    }

    pub fn kind(&self) -> Option<InvKind> {
        InvKind::from_u32(self.kind)
    }
}

impl Encodable for Inv {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.kind.consensus_encode(w)? + self.hash.consensus_encode(w)?)
    }
}

impl Decodable for Inv {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Inv { kind: Decodable::consensus_decode(r)?, hash: Decodable::consensus_decode(r)? })
    }
}

/// A single connected peer: ordered, framed, best-effort delivery. Sends
/// cannot fail from the core's point of view.
pub trait Peer: Send + Sync {
    fn id(&self) -> u64;

    fn addr(&self) -> NetAddress;

    /// The peer's negotiated protocol version.
    fn version(&self) -> u32;

    /// The serialization version to use when sending to this peer.
    fn send_version(&self) -> u32;

    fn is_inbound(&self) -> bool;

    /// True for the temporary connections opened for verification
    /// exchanges.
    fn is_service_node_conn(&self) -> bool;

    fn send(&self, message: Message);

    fn push_inventory(&self, inv: Inv);

    /// Forget that the peer asked us for this inventory hash.
    fn clear_ask_for(&self, hash: &[u8; 32]);

    /// Feed the shared ban manager.
    fn misbehave(&self, score: u32);

    fn disconnect(&self);
}

/// The connection pool seen from the core: snapshots instead of callbacks,
/// lock-free inventory fanout.
pub trait PeerBus: Send + Sync {
    /// Snapshot of fully-connected peers. Sends happen against the
    /// snapshot after any component lock is released.
    fn peers(&self) -> Vec<Arc<dyn Peer>>;

    /// Fire-and-forget inventory broadcast to all fully-connected peers.
    fn relay_inv(&self, inv: Inv);

    fn find_peer(&self, addr: &NetAddress) -> Option<Arc<dyn Peer>>;

    /// Schedule a direct service-node connection attempt.
    fn add_pending_service_node(&self, addr: NetAddress);

    /// True if `addr` is already a service-node connection or one is being
    /// torn down.
    fn is_service_node_or_disconnect_requested(&self, addr: &NetAddress) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{deserialize, serialize};

    #[test]
    fn inv_round_trip() {
        let inv = Inv::new(InvKind::Announce, [9u8; 32]);
        let encoded = serialize(&inv);
        assert_eq!(encoded.len(), 36);
        let decoded: Inv = deserialize(&encoded).unwrap();
        assert_eq!(decoded, inv);
        assert_eq!(decoded.kind(), Some(InvKind::Announce));
    }

    #[test]
    fn unknown_kind_decodes_but_does_not_classify() {
        let inv = Inv { kind: 99, hash: [0u8; 32] };
        let decoded: Inv = deserialize(&serialize(&inv)).unwrap();
        assert_eq!(decoded.kind(), None);
    }
}
