//! Peer abstractions and the wire message set.

pub mod message;
pub mod peer;

pub use message::Message;
pub use peer::{Inv, InvKind, Peer, PeerBus};
