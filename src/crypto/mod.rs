//! Message signing for the gossip protocol.

pub mod signer;

pub use signer::{HashSigner, MessageSigner, OperatorKeyPair, SignerError, MESSAGE_MAGIC};
