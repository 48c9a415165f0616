//! Service-node subsystem: registry, liveness gossip, payment election
//! and proof-of-service verification.
//!
//! This library implements the privileged-worker layer of a Dash-style
//! network:
//!
//! - Maintain a replicated registry of live service nodes keyed by their
//!   on-chain collateral
//! - Originate, validate and relay signed announce and ping gossip
//! - Deterministically elect the next payout recipient per block and
//!   collect signed payment votes confirming the pick
//! - Issue nonce-challenge verifications between nodes to detect and
//!   score impersonators
//!
//! The surrounding node supplies the chain view ([`chain::ChainAdapter`]),
//! the connection pool ([`net::PeerBus`]), connectivity probes
//! ([`active::ConnectivityCheck`]) and governance checks
//! ([`payments::SuperblockOracle`]); the subsystem exposes message
//! handlers, block validators and tip/tick callbacks through
//! [`context::NodeContext`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use servicenode::config::NodeConfig;
//! use servicenode::context::NodeContext;
//!
//! # fn wire(chain: Arc<dyn servicenode::chain::ChainAdapter>,
//! #         bus: Arc<dyn servicenode::net::PeerBus>,
//! #         connectivity: Arc<dyn servicenode::active::ConnectivityCheck>,
//! #         oracle: Arc<dyn servicenode::payments::SuperblockOracle>)
//! #         -> Result<(), servicenode::error::Error> {
//! let config = NodeConfig::mainnet().with_snapshot_path("./sncache.dat");
//! let context = NodeContext::new(config, chain, bus, connectivity, oracle)?;
//!
//! // route inbound peer messages:
//! //   context.process_message(&peer, message);
//! // fan out consensus callbacks:
//! //   context.updated_block_tip(height, initial_download, best_header);
//! // and drive the ticker every sync::TICK_SECONDS:
//! //   context.tick();
//! # Ok(())
//! # }
//! ```

pub mod active;
pub mod cache;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod context;
pub mod crypto;
pub mod error;
pub mod hash_types;
pub mod net;
pub mod params;
pub mod payments;
pub mod primitives;
pub mod registry;
pub mod snapshot;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use active::{ActiveServiceNode, ActiveState};
pub use chain::{ChainAdapter, Coin};
pub use config::NodeConfig;
pub use context::NodeContext;
pub use error::{Error, PaymentError, RegistryError};
pub use hash_types::{AnnounceHash, BlockHash, KeyId, PingHash, Txid, VerifyHash, VoteHash};
pub use net::{Inv, InvKind, Message, Peer, PeerBus};
pub use params::{Network, NetworkParams, SporkSet};
pub use payments::{PaymentLedger, PaymentVote};
pub use primitives::{NetAddress, OutPoint, PubKey, ScriptBuf, TxOut};
pub use registry::{
    ServiceNode, ServiceNodeAnnounce, ServiceNodePing, ServiceNodeRegistry, ServiceNodeState,
    ServiceNodeVerification,
};
pub use sync::SyncDriver;

/// Current version of this library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
