//! Node configuration for the service-node subsystem.

use std::path::PathBuf;

use crate::crypto::{OperatorKeyPair, SignerError};
use crate::params::{Network, NetworkParams};
use crate::primitives::NetAddress;

/// Configuration handed to [`crate::context::NodeContext`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeConfig {
    /// Which network this node runs on.
    pub network: Network,
    /// Whether this node is configured as a service node.
    pub service_node_mode: bool,
    /// Whether the node accepts inbound connections.
    pub listen: bool,
    /// Hex-encoded operator secret key, required in service-node mode.
    pub operator_secret_hex: Option<String>,
    /// Externally visible address, when not discovered from peers.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub external_address: Option<NetAddress>,
    /// Where the registry snapshot lives between runs.
    pub snapshot_path: Option<PathBuf>,
}

impl NodeConfig {
    pub fn mainnet() -> Self {
        NodeConfig {
            network: Network::Mainnet,
            service_node_mode: false,
            listen: true,
            operator_secret_hex: None,
            external_address: None,
            snapshot_path: None,
        }
    }

    pub fn regtest() -> Self {
        NodeConfig { network: Network::Regtest, ..NodeConfig::mainnet() }
    }

    pub fn with_service_node_mode(mut self, secret_hex: impl Into<String>) -> Self {
        self.service_node_mode = true;
        self.operator_secret_hex = Some(secret_hex.into());
        self
    }

    pub fn with_external_address(mut self, addr: NetAddress) -> Self {
        self.external_address = Some(addr);
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn params(&self) -> NetworkParams {
        let mut params = match self.network {
            Network::Mainnet => NetworkParams::mainnet(),
            Network::Testnet | Network::Devnet => NetworkParams::testnet(),
            Network::Regtest => NetworkParams::regtest(),
        };
        params.network = self.network;
        params
    }

    /// Decode the configured operator key.
    pub fn operator_keypair(&self) -> Result<Option<OperatorKeyPair>, SignerError> {
        let hex_str = match &self.operator_secret_hex {
            Some(hex_str) => hex_str,
            None => return Ok(None),
        };
        let bytes = hex::decode(hex_str).map_err(|_| SignerError::BadLength)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| SignerError::BadLength)?;
        OperatorKeyPair::from_secret_bytes(&bytes, true).map(Some)
    }
}
