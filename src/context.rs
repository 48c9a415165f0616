//! Wiring of the subsystem's components behind explicit handles.
//!
//! Inbound peer messages are routed by command, block-tip callbacks fan
//! out to the registry, ledger, sync driver and controller in order,
//! and the ticker drives
//! housekeeping. This is the only place that knows about every component
//! at once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::active::{ActiveServiceNode, ConnectivityCheck};
use crate::cache::FulfilledRequestCache;
use crate::chain::ChainAdapter;
use crate::config::NodeConfig;
use crate::error::Error;
use crate::net::{Message, Peer, PeerBus};
use crate::params::SporkSet;
use crate::payments::{PaymentLedger, SuperblockOracle};
use crate::registry::ServiceNodeRegistry;
use crate::sync::SyncDriver;

/// Housekeeping cadence, in ticks.
const HOUSEKEEPING_TICKS: u64 = 10;

/// Owns the long-lived services of the subsystem and routes events
/// between them and the surrounding node.
pub struct NodeContext {
    pub chain: Arc<dyn ChainAdapter>,
    pub bus: Arc<dyn PeerBus>,
    pub sporks: Arc<SporkSet>,
    pub fulfilled: Arc<FulfilledRequestCache>,
    pub registry: Arc<ServiceNodeRegistry>,
    pub ledger: Arc<PaymentLedger>,
    pub sync: Arc<SyncDriver>,
    pub active: Arc<ActiveServiceNode>,
    pub shutdown: Arc<AtomicBool>,
    config: NodeConfig,
    tick_count: AtomicU64,
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainAdapter>,
        bus: Arc<dyn PeerBus>,
        connectivity: Arc<dyn ConnectivityCheck>,
        oracle: Arc<dyn SuperblockOracle>,
    ) -> Result<Self, Error> {
        let params = config.params();
        let sporks = Arc::new(SporkSet::new());
        let fulfilled = Arc::new(FulfilledRequestCache::new(params.fulfilled_request_ttl));
        let shutdown = Arc::new(AtomicBool::new(false));

        let registry = Arc::new(ServiceNodeRegistry::new(
            chain.clone(),
            params.clone(),
            sporks.clone(),
            fulfilled.clone(),
            shutdown.clone(),
        ));
        let ledger = Arc::new(PaymentLedger::new(
            chain.clone(),
            params,
            sporks.clone(),
            fulfilled.clone(),
            oracle,
        ));
        let sync = Arc::new(SyncDriver::new(config.network, config.service_node_mode));
        let active = Arc::new(ActiveServiceNode::new(&config, connectivity, sporks.clone()));

        let context = NodeContext {
            chain,
            bus,
            sporks,
            fulfilled,
            registry,
            ledger,
            sync,
            active,
            shutdown,
            config,
            tick_count: AtomicU64::new(0),
        };
        context.load_snapshot()?;
        Ok(context)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    fn punish(&self, peer: &dyn Peer, score: u32, what: &str) {
        if score > 0 {
            tracing::debug!(target: "net", peer = peer.id(), score, what, "misbehaving peer");
            peer.misbehave(score);
        }
    }

    /// Route one inbound message.
    pub fn process_message(&self, peer: &dyn Peer, message: Message) {
        let identity = self.active.identity();
        let identity = identity.as_ref();

        match message {
            Message::Announce(announce) => {
                match self.registry.process_announce(
                    Some(peer),
                    announce,
                    &self.sync,
                    identity,
                    &*self.bus,
                ) {
                    Ok(outcome) => {
                        if outcome.trigger_self_activation {
                            self.active.manage_state(
                                &self.registry,
                                &self.sync,
                                &*self.chain,
                                &*self.bus,
                            );
                        }
                    }
                    Err(err) => self.punish(peer, err.dos_score(), "announce"),
                }
                let (added, _removed) = self.registry.take_update_flags();
                if added {
                    tracing::debug!(target: "registry", "service nodes added");
                }
            }
            Message::Ping(ping) => {
                if let Err(err) =
                    self.registry.process_ping(peer, ping, &self.sync, identity, &*self.bus)
                {
                    self.punish(peer, err.dos_score(), "ping");
                }
            }
            Message::DsegRequest(outpoint) => {
                if let Err(err) = self.registry.process_dseg_request(peer, outpoint, &self.sync) {
                    self.punish(peer, err.dos_score(), "dseg");
                }
            }
            Message::Verify(verify) => {
                if let Err(err) =
                    self.registry.process_verify(peer, verify, &self.sync, identity, &*self.bus)
                {
                    self.punish(peer, err.dos_score(), "verify");
                }
            }
            Message::PaymentSync { .. } => {
                if let Err(err) = self.ledger.process_payment_sync(peer, &self.sync) {
                    self.punish(peer, err.dos_score(), "payment sync");
                }
            }
            Message::PaymentVote(vote) => {
                if let Err(err) = self.ledger.process_vote(
                    peer,
                    vote,
                    &self.registry,
                    &self.sync,
                    self.config.service_node_mode,
                    &*self.bus,
                ) {
                    self.punish(peer, err.dos_score(), "payment vote");
                }
            }
            Message::SyncStatusCount { item_id, count } => {
                self.sync.process_sync_status_count(item_id, count, peer.id());
            }
            Message::GetData(invs) => {
                for inv in &invs {
                    self.registry.serve_inv(peer, inv);
                    self.ledger.serve_inv(peer, inv);
                }
            }
            Message::Inv(_) | Message::GetSporks | Message::Reject { .. } => {
                // inventory download scheduling, spork serving and reject
                // bookkeeping all live with the surrounding node
            }
        }
    }

    /// Consensus-layer tip callback.
    pub fn updated_block_tip(&self, height: i32, initial_download: bool, best_header: bool) {
        let identity = self.active.identity();
        self.registry.updated_block_tip(
            height,
            &self.sync,
            &self.ledger,
            self.config.service_node_mode,
        );
        self.ledger.updated_block_tip(
            height,
            &self.registry,
            &self.sync,
            identity.as_ref(),
            &*self.bus,
        );
        self.sync.updated_block_tip(initial_download, best_header, &*self.bus, &self.fulfilled);
        self.active.manage_state(&self.registry, &self.sync, &*self.chain, &*self.bus);
    }

    pub fn accepted_block_header(&self) {
        self.sync.accepted_block_header();
    }

    pub fn notify_header_tip(&self) {
        self.sync.notify_header_tip();
    }

    /// Scheduler tick, expected every [`crate::sync::TICK_SECONDS`].
    pub fn tick(&self) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let identity = self.active.identity();
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed);

        let outcome =
            self.sync.process_tick(&self.registry, &self.ledger, &self.fulfilled, &*self.bus);
        if outcome.finished_now {
            self.active.manage_state(&self.registry, &self.sync, &*self.chain, &*self.bus);
        }

        self.registry.process_pending_recovery_requests(&*self.bus);
        self.registry.process_pending_verify_requests(&*self.bus);

        if tick % HOUSEKEEPING_TICKS == 0 {
            self.registry.check_and_remove(&self.sync, identity.as_ref(), &*self.bus);
            self.ledger.check_and_remove(self.registry.size(), &self.sync);
            self.registry.do_full_verification_step(&self.sync, identity.as_ref(), &*self.bus);
            self.active.manage_state(&self.registry, &self.sync, &*self.chain, &*self.bus);
            if let Some(warning) = self.registry.warn_daemon_updates(&self.sync) {
                tracing::warn!(target: "registry", %warning);
            }
        }
    }

    pub fn save_snapshot(&self) -> Result<(), Error> {
        if let Some(path) = &self.config.snapshot_path {
            crate::snapshot::save(path, &self.registry, &self.ledger)?;
        }
        Ok(())
    }

    fn load_snapshot(&self) -> Result<(), Error> {
        if let Some(path) = &self.config.snapshot_path {
            crate::snapshot::load(path, &self.registry, &self.ledger)?;
        }
        Ok(())
    }
}
