//! Consensus-compatible serialization.
//!
//! Everything that crosses the wire or lands in the snapshot file is
//! encoded with the network's canonical little-endian layout. The hashing
//! routines in the message modules stream their fields through these same
//! implementations.

pub mod encode;

pub use encode::{deserialize, serialize, Decodable, Encodable, VarInt};
