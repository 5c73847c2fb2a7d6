//! Local Host Table (node id -> entry)

use host_tracker_core::crypto::{compute_entry_hash, derive_node_id, verify_entry_hash};
use host_tracker_core::types::*;
use std::collections::BTreeMap;
use thiserror::Error;

/// Entry store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(NodeId),
    #[error("Unknown entry: {0}")]
    UnknownEntry(NodeId),
    #[error("Stale update for {node_id}: {timestamp} < {updated_at}")]
    StaleUpdate {
        node_id: NodeId,
        timestamp: u64,
        updated_at: u64,
    },
    #[error("Integrity violation for {node_id}: {source}")]
    Integrity {
        node_id: NodeId,
        #[source]
        source: host_tracker_core::Error,
    },
    #[error("Core error: {0}")]
    Core(#[from] host_tracker_core::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// The table itself. Ordered by node id so every peer enumerates the same
/// candidate list for neighbor selection.
#[derive(Debug, Clone, Default)]
pub struct EntryStore {
    entries: BTreeMap<NodeId, Entry>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a host from its pledge transaction. The entry starts inactive
    /// with no endpoints until the host's first join.
    pub fn add(&mut self, record: &TransactionRecord) -> Result<NodeId, StoreError> {
        let node_id = derive_node_id(&record.seed);
        if self.entries.contains_key(&node_id) {
            return Err(StoreError::DuplicateEntry(node_id));
        }

        let mut entry = Entry {
            hash: [0; 32],
            public_key: record.public_key,
            pledge_tx: record.key,
            pledge: record.space_pledged,
            proof_hash: record.pledge_proof,
            public_ip: None,
            tcp_port: None,
            ws_port: None,
            is_gateway: false,
            created_at: record.created_at,
            updated_at: record.created_at,
            interval: record.pledge_interval,
            status: HostStatus::Inactive,
            uptime: 0,
            log: Vec::new(),
        };
        entry.hash = compute_entry_hash(&entry)?;

        self.entries.insert(node_id, entry);
        Ok(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&Entry> {
        self.entries.get(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.entries.contains_key(node_id)
    }

    /// Apply an update. This is the only mutation path for existing entries.
    ///
    /// Time since the last update is credited to `uptime` only while the
    /// entry is active. The entry is rebuilt and rehashed before it replaces
    /// the stored one, so a failed update leaves the table untouched.
    pub fn apply(&mut self, update: Update) -> Result<&Entry, StoreError> {
        let node_id = update.node_id();
        let current = self
            .entries
            .get(&node_id)
            .ok_or(StoreError::UnknownEntry(node_id))?;

        let timestamp = update.timestamp();
        if timestamp < current.updated_at {
            return Err(StoreError::StaleUpdate {
                node_id,
                timestamp,
                updated_at: current.updated_at,
            });
        }

        let mut entry = current.clone();
        if entry.status.is_active() {
            entry.uptime += timestamp - entry.updated_at;
        }

        match &update {
            Update::Leave(_) | Update::Failure(_) => {
                entry.status = HostStatus::Inactive;
            }
            Update::Join(join) => {
                entry.status = HostStatus::Active;
                entry.public_ip = Some(join.public_ip);
                entry.tcp_port = Some(join.tcp_port);
                entry.ws_port = Some(join.ws_port);
                entry.is_gateway = join.is_gateway;
            }
            Update::Rejoin(_) => {
                entry.status = HostStatus::Active;
            }
        }

        entry.updated_at = timestamp;
        entry.log.push(update);
        entry.hash = compute_entry_hash(&entry)?;

        self.entries.insert(node_id, entry);
        Ok(&self.entries[&node_id])
    }

    /// Unconditional delete; expiry policy belongs to the caller.
    pub fn remove(&mut self, node_id: &NodeId) -> Option<Entry> {
        self.entries.remove(node_id)
    }

    pub fn all_ids(&self) -> Vec<NodeId> {
        self.entries.keys().copied().collect()
    }

    pub fn all_entries(&self) -> Vec<(NodeId, Entry)> {
        self.entries
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn active_ids(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.status.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Find the host registered under a public key
    pub fn find_by_public_key(&self, public_key: &Bytes32) -> Option<NodeId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.public_key == *public_key)
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recompute every entry hash. A mismatch means the table is corrupt.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        for (node_id, entry) in &self.entries {
            verify_entry_hash(entry).map_err(|source| StoreError::Integrity {
                node_id: *node_id,
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize the whole table for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let rows: Vec<(&NodeId, &Entry)> = self.entries.iter().collect();
        Ok(postcard::to_allocvec(&rows)?)
    }

    /// Restore a persisted table, rejecting it if any entry hash is stale
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let rows: Vec<(NodeId, Entry)> = postcard::from_bytes(bytes)?;
        let store = Self {
            entries: rows.into_iter().collect(),
        };
        store.verify_integrity()?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pledge_record(seed: &str) -> TransactionRecord {
        TransactionRecord {
            key: PledgeRef(*blake3::hash(seed.as_bytes()).as_bytes()),
            tx_type: TxType::Pledge,
            public_key: [7; 32],
            space_pledged: 100,
            pledge_proof: *blake3::hash(b"p1").as_bytes(),
            pledge_interval: 3_600_000,
            created_at: 1000,
            seed: seed.as_bytes().to_vec(),
        }
    }

    fn join(node_id: NodeId, timestamp: u64) -> Update {
        Update::Join(JoinUpdate {
            node_id,
            public_key: [7; 32],
            pledge_tx: PledgeRef([0; 32]),
            pledge: 100,
            proof_hash: [0; 32],
            public_ip: "1.2.3.4".parse().unwrap(),
            tcp_port: 9000,
            ws_port: 9001,
            is_gateway: false,
            timestamp,
            signature: None,
            neighbor_proofs: vec![],
        })
    }

    fn leave(node_id: NodeId, timestamp: u64) -> Update {
        Update::Leave(LeaveUpdate {
            node_id,
            previous: None,
            timestamp,
            signature: None,
        })
    }

    fn failure(node_id: NodeId, timestamp: u64) -> Update {
        Update::Failure(FailureUpdate {
            node_id,
            nonce: [0; 32],
            previous: None,
            timestamp,
            signatures: vec![],
        })
    }

    #[test]
    fn test_add_pledge_record() {
        let mut store = EntryStore::new();
        let node_id = store.add(&pledge_record("abc")).unwrap();

        assert_eq!(node_id.0, *blake3::hash(b"abc").as_bytes());
        let entry = store.get(&node_id).unwrap();
        assert_eq!(entry.status, HostStatus::Inactive);
        assert_eq!(entry.uptime, 0);
        assert_eq!(entry.pledge, 100);
        assert_eq!(entry.updated_at, 1000);
        assert!(entry.public_ip.is_none());
        assert!(entry.log.is_empty());
        assert!(verify_entry_hash(entry).is_ok());
    }

    #[test]
    fn test_duplicate_add() {
        let mut store = EntryStore::new();
        store.add(&pledge_record("abc")).unwrap();
        let result = store.add(&pledge_record("abc"));
        assert!(matches!(result, Err(StoreError::DuplicateEntry(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_join_then_failure() {
        let mut store = EntryStore::new();
        let node_id = store.add(&pledge_record("abc")).unwrap();

        let entry = store.apply(join(node_id, 2000)).unwrap();
        assert_eq!(entry.status, HostStatus::Active);
        assert_eq!(entry.updated_at, 2000);
        assert_eq!(entry.public_ip, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(entry.tcp_port, Some(9000));
        assert_eq!(entry.log.len(), 1);

        let entry = store.apply(failure(node_id, 5000)).unwrap();
        assert_eq!(entry.uptime, 3000);
        assert_eq!(entry.status, HostStatus::Inactive);
        assert_eq!(entry.log.len(), 2);
        assert!(verify_entry_hash(entry).is_ok());
    }

    #[test]
    fn test_second_leave_does_not_count_inactive_time() {
        let mut store = EntryStore::new();
        let node_id = store.add(&pledge_record("abc")).unwrap();

        store.apply(join(node_id, 2000)).unwrap();
        store.apply(leave(node_id, 3000)).unwrap();
        let entry = store.apply(leave(node_id, 3000)).unwrap();
        assert_eq!(entry.uptime, 1000);

        let entry = store.apply(leave(node_id, 9000)).unwrap();
        assert_eq!(entry.uptime, 1000);
        assert_eq!(entry.log.len(), 4);
    }

    #[test]
    fn test_repeated_join_keeps_uptime() {
        let mut store = EntryStore::new();
        let node_id = store.add(&pledge_record("abc")).unwrap();

        store.apply(join(node_id, 2000)).unwrap();
        store.apply(join(node_id, 3000)).unwrap();
        let entry = store.apply(leave(node_id, 5000)).unwrap();
        assert_eq!(entry.uptime, 3000);
    }

    #[test]
    fn test_rejoin_reactivates_without_endpoints() {
        let mut store = EntryStore::new();
        let node_id = store.add(&pledge_record("abc")).unwrap();

        let entry = store
            .apply(Update::Rejoin(RejoinUpdate {
                node_id,
                previous: None,
                timestamp: 1500,
                signature: None,
            }))
            .unwrap();
        assert!(entry.status.is_active());
        assert!(entry.public_ip.is_none());
    }

    #[test]
    fn test_unknown_and_stale_updates() {
        let mut store = EntryStore::new();
        let missing = derive_node_id(b"missing");
        assert!(matches!(
            store.apply(join(missing, 2000)),
            Err(StoreError::UnknownEntry(_))
        ));

        let node_id = store.add(&pledge_record("abc")).unwrap();
        store.apply(join(node_id, 2000)).unwrap();
        let before = store.get(&node_id).unwrap().clone();

        assert!(matches!(
            store.apply(leave(node_id, 1999)),
            Err(StoreError::StaleUpdate { .. })
        ));
        assert_eq!(store.get(&node_id).unwrap(), &before);
    }

    #[test]
    fn test_projections_and_remove() {
        let mut store = EntryStore::new();
        let a = store.add(&pledge_record("a")).unwrap();
        let b = store.add(&pledge_record("b")).unwrap();
        store.apply(join(a, 2000)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.active_ids(), vec![a]);
        let mut all = vec![a, b];
        all.sort();
        assert_eq!(store.all_ids(), all);
        assert_eq!(store.all_entries().len(), 2);

        assert!(store.remove(&a).is_some());
        assert!(store.remove(&a).is_none());
        assert!(store.active_ids().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_hash_is_stable() {
        let mut store = EntryStore::new();
        let node_id = store.add(&pledge_record("abc")).unwrap();
        store.apply(join(node_id, 2000)).unwrap();

        let entry = store.get(&node_id).unwrap();
        assert_eq!(
            compute_entry_hash(entry).unwrap(),
            compute_entry_hash(entry).unwrap()
        );
        assert_eq!(compute_entry_hash(entry).unwrap(), entry.hash);
    }

    #[test]
    fn test_bytes_roundtrip_and_tamper_detection() {
        let mut store = EntryStore::new();
        let node_id = store.add(&pledge_record("abc")).unwrap();
        store.apply(join(node_id, 2000)).unwrap();

        let bytes = store.to_bytes().unwrap();
        let restored = EntryStore::from_bytes(&bytes).unwrap();
        assert_eq!(restored.get(&node_id), store.get(&node_id));

        let mut tampered = store.clone();
        tampered.entries.get_mut(&node_id).unwrap().uptime = 99;
        let bytes = tampered.to_bytes().unwrap();
        assert!(matches!(
            EntryStore::from_bytes(&bytes),
            Err(StoreError::Integrity { .. })
        ));
    }
}
