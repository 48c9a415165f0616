//! State machine of the locally configured service node: detect our
//! external endpoint, confirm we are listed, keep pinging.

use std::sync::Arc;

use bitcoin_hashes::Hash;
use parking_lot::Mutex;

use crate::chain::ChainAdapter;
use crate::crypto::OperatorKeyPair;
use crate::net::{Inv, InvKind, Peer, PeerBus};
use crate::params::{self, Network, SporkSet, MIN_PING_SECONDS, SENTINEL_PING_MAX_SECONDS};
use crate::primitives::{NetAddress, OutPoint};
use crate::registry::{LocalIdentity, ServiceNodePing, ServiceNodeRegistry};
use crate::sync::SyncDriver;

/// Connectivity probes the core cannot perform itself; the surrounding
/// node supplies sockets, tests supply stubs.
pub trait ConnectivityCheck: Send + Sync {
    /// Our externally visible address, optionally derived from what a
    /// peer sees.
    fn detect_external_address(&self, peers: &[Arc<dyn Peer>]) -> Option<NetAddress>;

    /// Whether a test connection to `addr` succeeds.
    fn probe_inbound(&self, addr: &NetAddress) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Initial,
    SyncInProcess,
    InputTooNew,
    NotCapable,
    Started,
}

impl ActiveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveState::Initial => "INITIAL",
            ActiveState::SyncInProcess => "SYNC_IN_PROCESS",
            ActiveState::InputTooNew => "INPUT_TOO_NEW",
            ActiveState::NotCapable => "NOT_CAPABLE",
            ActiveState::Started => "STARTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Unknown,
    Remote,
}

struct ActiveInner {
    kind: NodeKind,
    state: ActiveState,
    pinger_enabled: bool,
    outpoint: OutPoint,
    service: NetAddress,
    not_capable_reason: String,
    sentinel_ping_time: i64,
    sentinel_version: u32,
}

/// The controller for "this node is a service node" mode. Inert when the
/// node is not configured as one.
pub struct ActiveServiceNode {
    network: Network,
    listen: bool,
    operator: Option<OperatorKeyPair>,
    external_address: Option<NetAddress>,
    connectivity: Arc<dyn ConnectivityCheck>,
    sporks: Arc<SporkSet>,
    inner: Mutex<ActiveInner>,
}

impl ActiveServiceNode {
    pub fn new(
        config: &crate::config::NodeConfig,
        connectivity: Arc<dyn ConnectivityCheck>,
        sporks: Arc<SporkSet>,
    ) -> Self {
        let operator = if config.service_node_mode {
            config.operator_keypair().ok().flatten()
        } else {
            None
        };
        ActiveServiceNode {
            network: config.network,
            listen: config.listen,
            operator,
            external_address: config.external_address,
            connectivity,
            sporks,
            inner: Mutex::new(ActiveInner {
                kind: NodeKind::Unknown,
                state: ActiveState::Initial,
                pinger_enabled: false,
                outpoint: OutPoint::null(),
                service: NetAddress::default(),
                not_capable_reason: String::new(),
                sentinel_ping_time: 0,
                sentinel_version: params::DEFAULT_SENTINEL_VERSION,
            }),
        }
    }

    pub fn is_service_node(&self) -> bool {
        self.operator.is_some()
    }

    pub fn state(&self) -> ActiveState {
        self.inner.lock().state
    }

    pub fn not_capable_reason(&self) -> String {
        self.inner.lock().not_capable_reason.clone()
    }

    pub fn status(&self) -> String {
        let inner = self.inner.lock();
        match inner.state {
            ActiveState::Initial => "Node just started, not yet activated".to_string(),
            ActiveState::SyncInProcess => {
                "Sync in progress. Must wait until sync is complete to start service node"
                    .to_string()
            }
            ActiveState::InputTooNew => {
                "Service node input must have more confirmations".to_string()
            }
            ActiveState::NotCapable => {
                format!("Not capable service node: {}", inner.not_capable_reason)
            }
            ActiveState::Started => "Service node successfully started".to_string(),
        }
    }

    pub fn operator_pubkey(&self) -> Option<&crate::primitives::PubKey> {
        self.operator.as_ref().map(|key| key.public_key())
    }

    /// The identity handed to the registry and ledger paths that sign or
    /// self-match. Present as soon as the node is configured, even while
    /// the outpoint is still unknown.
    pub fn identity(&self) -> Option<LocalIdentity> {
        let operator = self.operator.clone()?;
        let outpoint = self.inner.lock().outpoint;
        Some(LocalIdentity { outpoint, operator })
    }

    /// Sentinel watchdog report.
    pub fn update_sentinel_ping(&self, version: u32, adjusted_time: i64) {
        let mut inner = self.inner.lock();
        inner.sentinel_version = version;
        inner.sentinel_ping_time = adjusted_time;
    }

    /// Drive the self-state machine; called on sync completion and every
    /// tick.
    pub fn manage_state(
        &self,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
        chain: &dyn ChainAdapter,
        bus: &dyn PeerBus,
    ) {
        let operator = match &self.operator {
            Some(operator) => operator,
            None => return,
        };

        if self.network != Network::Regtest && !sync.is_blockchain_synced() {
            let mut inner = self.inner.lock();
            inner.state = ActiveState::SyncInProcess;
            tracing::info!(target: "active", state = inner.state.as_str(), "waiting for sync");
            return;
        }

        {
            let mut inner = self.inner.lock();
            if inner.state == ActiveState::SyncInProcess {
                inner.state = ActiveState::Initial;
            }
        }

        if self.inner.lock().kind == NodeKind::Unknown {
            self.manage_state_initial(bus);
        }
        if self.inner.lock().kind == NodeKind::Remote {
            self.manage_state_remote(registry, sync, operator);
        }

        self.send_ping(registry, sync, chain, bus);
    }

    fn set_not_capable(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.state = ActiveState::NotCapable;
        inner.not_capable_reason = reason.to_string();
        tracing::warn!(target: "active", reason, "service node not capable");
    }

    fn manage_state_initial(&self, bus: &dyn PeerBus) {
        if !self.listen {
            self.set_not_capable(
                "Service node must accept connections from outside. Make sure the listen \
                 configuration option is not overwritten by some other parameter.",
            );
            return;
        }

        let candidate = self.external_address.or_else(|| {
            let peers = bus.peers();
            if peers.is_empty() {
                None
            } else {
                self.connectivity.detect_external_address(&peers)
            }
        });
        let service = match candidate {
            Some(service)
                if crate::registry::ServiceNode::addr_is_valid(&service, self.network) =>
            {
                service
            }
            _ => {
                self.set_not_capable(
                    "Can't detect valid external address. Please consider using the externalip \
                     configuration option if the problem persists. Make sure to use an IPv4 \
                     address only.",
                );
                return;
            }
        };

        let mainnet_port = Network::Mainnet.default_port();
        if self.network.is_mainnet() {
            if service.port() != mainnet_port {
                self.set_not_capable(&format!(
                    "Invalid port: {} - only {} is supported on mainnet.",
                    service.port(),
                    mainnet_port
                ));
                return;
            }
        } else if service.port() == mainnet_port {
            self.set_not_capable(&format!(
                "Invalid port: {} - {} is only supported on mainnet.",
                service.port(),
                mainnet_port
            ));
            return;
        }

        tracing::info!(target: "active", %service, "checking inbound connectivity");
        if !self.connectivity.probe_inbound(&service) {
            self.set_not_capable(&format!("Could not connect to {}", service));
            return;
        }

        let mut inner = self.inner.lock();
        inner.service = service;
        inner.kind = NodeKind::Remote;
    }

    fn manage_state_remote(
        &self,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
        operator: &OperatorKeyPair,
    ) {
        registry.check_service_node(operator.public_key(), sync, self.identity().as_ref());

        let info = match registry.get_info_by_operator_key(operator.public_key()) {
            Some(info) => info,
            None => {
                self.set_not_capable("Service node not in service node list");
                return;
            }
        };

        if info.protocol_version != params::PROTOCOL_VERSION {
            self.set_not_capable("Invalid protocol version");
            return;
        }
        {
            let inner = self.inner.lock();
            if inner.service != info.addr && inner.kind == NodeKind::Remote {
                drop(inner);
                self.set_not_capable(
                    "Broadcasted IP doesn't match our external address. Make sure you issued a \
                     new broadcast if the IP of this service node changed recently.",
                );
                return;
            }
        }
        if !info.state.map(|state| state.is_valid_for_auto_start()).unwrap_or(false) {
            let state_name = info.state.map(|state| state.as_str()).unwrap_or("UNKNOWN");
            self.set_not_capable(&format!("Service node in {} state", state_name));
            return;
        }

        let mut inner = self.inner.lock();
        if inner.state != ActiveState::Started {
            tracing::info!(target: "active", node = %info.outpoint.to_short_string(), "started");
            inner.outpoint = info.outpoint;
            inner.service = info.addr;
            inner.pinger_enabled = true;
            inner.state = ActiveState::Started;
        }
    }

    /// Emit a self-ping, at most once per ping interval.
    fn send_ping(
        &self,
        registry: &ServiceNodeRegistry,
        sync: &SyncDriver,
        chain: &dyn ChainAdapter,
        bus: &dyn PeerBus,
    ) -> bool {
        let operator = match &self.operator {
            Some(operator) => operator,
            None => return false,
        };
        let (outpoint, sentinel_version, sentinel_ping_time) = {
            let inner = self.inner.lock();
            if !inner.pinger_enabled {
                return false;
            }
            (inner.outpoint, inner.sentinel_version, inner.sentinel_ping_time)
        };

        if !registry.has(&outpoint) {
            self.set_not_capable("Service node not in service node list");
            return false;
        }

        let mut ping = match ServiceNodePing::new(outpoint, chain) {
            Some(ping) => ping,
            None => return false,
        };
        ping.sentinel_version = sentinel_version;
        ping.sentinel_is_current =
            (chain.adjusted_time() - sentinel_ping_time).abs() < SENTINEL_PING_MAX_SECONDS;
        ping.sign(operator, self.sporks.is_new_sigs_active(), chain.adjusted_time());

        if registry.is_pinged_within(&outpoint, MIN_PING_SECONDS, Some(ping.sig_time)) {
            tracing::debug!(target: "active", "too early to send another ping");
            return false;
        }

        registry.set_last_ping(&outpoint, ping.clone());
        tracing::info!(target: "active", node = %outpoint.to_short_string(), "relaying ping");
        if sync.is_synced() {
            let hash = ping.hash(self.sporks.is_new_sigs_active());
            bus.relay_inv(Inv::new(InvKind::Ping, hash.to_byte_array()));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::test_utils::{StubConnectivity, TEST_SECRET_HEX};

    fn controller(config: NodeConfig, reachable: bool) -> ActiveServiceNode {
        ActiveServiceNode::new(
            &config,
            Arc::new(StubConnectivity { address: None, reachable }),
            Arc::new(SporkSet::new()),
        )
    }

    #[test]
    fn inert_without_service_node_mode() {
        let active = controller(NodeConfig::mainnet(), true);
        assert!(!active.is_service_node());
        assert!(active.identity().is_none());
    }

    #[test]
    fn listen_disabled_is_not_capable() {
        let mut config = NodeConfig::mainnet().with_service_node_mode(TEST_SECRET_HEX);
        config.listen = false;
        let active = controller(config, true);
        let bus = crate::test_utils::MockBus::new();
        active.manage_state_initial(&bus);
        assert_eq!(active.state(), ActiveState::NotCapable);
        assert!(active.not_capable_reason().contains("listen"));
    }

    #[test]
    fn wrong_port_is_not_capable() {
        let addr =
            NetAddress::new_ipv4(std::net::Ipv4Addr::new(8, 8, 8, 8), 9999);
        let config = NodeConfig::mainnet()
            .with_service_node_mode(TEST_SECRET_HEX)
            .with_external_address(addr);
        let active = controller(config, true);
        let bus = crate::test_utils::MockBus::new();
        active.manage_state_initial(&bus);
        assert_eq!(active.state(), ActiveState::NotCapable);
        assert!(active.not_capable_reason().contains("port"));
    }

    #[test]
    fn unreachable_address_is_not_capable() {
        let addr = NetAddress::new_ipv4(
            std::net::Ipv4Addr::new(8, 8, 8, 8),
            Network::Mainnet.default_port(),
        );
        let config = NodeConfig::mainnet()
            .with_service_node_mode(TEST_SECRET_HEX)
            .with_external_address(addr);
        let active = controller(config, false);
        let bus = crate::test_utils::MockBus::new();
        active.manage_state_initial(&bus);
        assert_eq!(active.state(), ActiveState::NotCapable);
        assert!(active.not_capable_reason().contains("Could not connect"));
    }

    #[test]
    fn reachable_address_becomes_remote() {
        let addr = NetAddress::new_ipv4(
            std::net::Ipv4Addr::new(8, 8, 8, 8),
            Network::Mainnet.default_port(),
        );
        let config = NodeConfig::mainnet()
            .with_service_node_mode(TEST_SECRET_HEX)
            .with_external_address(addr);
        let active = controller(config, true);
        let bus = crate::test_utils::MockBus::new();
        active.manage_state_initial(&bus);
        assert_eq!(active.inner.lock().kind, NodeKind::Remote);
        assert_eq!(active.inner.lock().service, addr);
    }
}
