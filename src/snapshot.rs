//! Flat-file snapshot of the registry and the payment ledger.
//!
//! One consensus-encoded file, written to a temporary name and renamed
//! into place. A version-string mismatch on load clears everything and
//! starts fresh rather than attempting migration.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::consensus::{encode, serialize, Decodable, Encodable};
use crate::error::Error;
use crate::hash_types::{AnnounceHash, PingHash, VoteHash};
use crate::payments::{BlockPayees, PaymentLedger, PaymentVote};
use crate::primitives::{NetAddress, OutPoint};
use crate::registry::{ServiceNode, ServiceNodeAnnounce, ServiceNodePing, ServiceNodeRegistry};

/// Bumped whenever the layout below changes.
pub const SNAPSHOT_VERSION: &str = "ServiceNodeRegistry-Version-8";

#[derive(Default)]
pub(crate) struct RegistrySnapshot {
    pub nodes: BTreeMap<OutPoint, ServiceNode>,
    pub asked_us_for_list: BTreeMap<NetAddress, i64>,
    pub we_asked_for_list: BTreeMap<NetAddress, i64>,
    pub we_asked_for_entry: BTreeMap<OutPoint, BTreeMap<NetAddress, i64>>,
    pub recovery_requests: BTreeMap<AnnounceHash, (i64, BTreeSet<NetAddress>)>,
    pub recovery_good_replies: BTreeMap<AnnounceHash, Vec<ServiceNodeAnnounce>>,
    pub last_sentinel_ping_time: i64,
    pub dsq_count: i64,
    pub seen_announces: BTreeMap<AnnounceHash, (i64, ServiceNodeAnnounce)>,
    pub seen_pings: BTreeMap<PingHash, ServiceNodePing>,
}

impl Encodable for RegistrySnapshot {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.nodes.consensus_encode(w)?;
        len += self.asked_us_for_list.consensus_encode(w)?;
        len += self.we_asked_for_list.consensus_encode(w)?;
        len += self.we_asked_for_entry.consensus_encode(w)?;
        len += self.recovery_requests.consensus_encode(w)?;
        len += self.recovery_good_replies.consensus_encode(w)?;
        len += self.last_sentinel_ping_time.consensus_encode(w)?;
        len += self.dsq_count.consensus_encode(w)?;
        len += self.seen_announces.consensus_encode(w)?;
        len += self.seen_pings.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for RegistrySnapshot {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(RegistrySnapshot {
            nodes: Decodable::consensus_decode(r)?,
            asked_us_for_list: Decodable::consensus_decode(r)?,
            we_asked_for_list: Decodable::consensus_decode(r)?,
            we_asked_for_entry: Decodable::consensus_decode(r)?,
            recovery_requests: Decodable::consensus_decode(r)?,
            recovery_good_replies: Decodable::consensus_decode(r)?,
            last_sentinel_ping_time: Decodable::consensus_decode(r)?,
            dsq_count: Decodable::consensus_decode(r)?,
            seen_announces: Decodable::consensus_decode(r)?,
            seen_pings: Decodable::consensus_decode(r)?,
        })
    }
}

#[derive(Default)]
pub(crate) struct LedgerSnapshot {
    pub votes: BTreeMap<VoteHash, PaymentVote>,
    pub blocks: BTreeMap<i32, BlockPayees>,
}

impl Encodable for LedgerSnapshot {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.votes.consensus_encode(w)? + self.blocks.consensus_encode(w)?)
    }
}

impl Decodable for LedgerSnapshot {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(LedgerSnapshot {
            votes: Decodable::consensus_decode(r)?,
            blocks: Decodable::consensus_decode(r)?,
        })
    }
}

struct SnapshotFile {
    version: String,
    registry: RegistrySnapshot,
    ledger: LedgerSnapshot,
}

impl Encodable for SnapshotFile {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += self.registry.consensus_encode(w)?;
        len += self.ledger.consensus_encode(w)?;
        Ok(len)
    }
}

/// Write the current registry and ledger state to `path`.
pub fn save(
    path: &Path,
    registry: &ServiceNodeRegistry,
    ledger: &PaymentLedger,
) -> Result<(), Error> {
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION.to_string(),
        registry: registry.export_snapshot(),
        ledger: ledger.export_snapshot(),
    };
    let bytes = serialize(&file);

    let tmp = path.with_extension("new");
    {
        let mut out = fs::File::create(&tmp)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    tracing::info!(target: "snapshot", path = %path.display(), size = bytes.len(),
        "snapshot written");
    Ok(())
}

/// Load a snapshot into the registry and ledger. Returns `false` when the
/// file is absent or carries a different version string; both start
/// fresh in that case.
pub fn load(
    path: &Path,
    registry: &ServiceNodeRegistry,
    ledger: &PaymentLedger,
) -> Result<bool, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    let mut cursor = bytes.as_slice();
    let r = &mut cursor;
    let version = String::consensus_decode(r)?;
    if version != SNAPSHOT_VERSION {
        tracing::warn!(target: "snapshot", found = %version, expected = SNAPSHOT_VERSION,
            "snapshot version mismatch, starting fresh");
        registry.clear();
        ledger.clear();
        return Ok(false);
    }
    let registry_snapshot = RegistrySnapshot::consensus_decode(r)?;
    let ledger_snapshot = LedgerSnapshot::consensus_decode(r)?;
    if !cursor.is_empty() {
        return Err(encode::Error::ParseFailed("snapshot not consumed entirely").into());
    }

    registry.apply_snapshot(registry_snapshot);
    ledger.apply_snapshot(ledger_snapshot);
    tracing::info!(target: "snapshot", path = %path.display(), "snapshot loaded");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::VarInt;
    use crate::test_utils::{test_ledger, test_registry_with_nodes};

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sncache.dat");

        let (registry, _chain) = test_registry_with_nodes(3);
        let ledger = test_ledger();
        registry.update_last_sentinel_ping_time();
        save(&path, &registry, &ledger).unwrap();

        let (restored, _chain2) = test_registry_with_nodes(0);
        let restored_ledger = test_ledger();
        assert_eq!(restored.size(), 0);
        assert!(load(&path, &restored, &restored_ledger).unwrap());
        assert_eq!(restored.size(), 3);
        assert_eq!(restored.full_map().keys().collect::<Vec<_>>(),
            registry.full_map().keys().collect::<Vec<_>>());
    }

    #[test]
    fn missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _chain) = test_registry_with_nodes(0);
        let ledger = test_ledger();
        assert!(!load(&dir.path().join("nope.dat"), &registry, &ledger).unwrap());
    }

    #[test]
    fn version_mismatch_clears_and_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sncache.dat");

        // a file with a foreign version string
        let mut bytes = Vec::new();
        let foreign = "ServiceNodeRegistry-Version-7".to_string();
        VarInt(foreign.len() as u64).consensus_encode(&mut bytes).unwrap();
        bytes.extend_from_slice(foreign.as_bytes());
        fs::write(&path, &bytes).unwrap();

        let (registry, _chain) = test_registry_with_nodes(2);
        let ledger = test_ledger();
        assert!(!load(&path, &registry, &ledger).unwrap());
        assert_eq!(registry.size(), 0);
    }
}
