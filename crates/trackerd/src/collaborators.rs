//! External collaborators consulted by the tracker: the local identity wallet
//! and the pledge ledger.

use async_trait::async_trait;
use host_tracker_core::crypto::derive_node_id;
use host_tracker_core::types::*;
use host_tracker_core::KeyPair;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Wallet errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("No pledge recorded for this host")]
    NoPledge,
}

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot parse error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// The local host's identity as seen by the protocol
#[derive(Clone, Debug)]
pub struct Profile {
    pub id: NodeId,
    pub public_key: Bytes32,
    pub keypair: KeyPair,
    pub pledge: Option<Pledge>,
}

impl Profile {
    pub fn pledge(&self) -> Result<&Pledge, WalletError> {
        self.pledge.as_ref().ok_or(WalletError::NoPledge)
    }
}

/// Identity provider
pub trait Wallet: Send + Sync {
    fn profile(&self) -> Result<Profile, WalletError>;
}

/// Wallet backed by an in-process keypair and declared seed
pub struct LocalWallet {
    profile: Profile,
}

impl LocalWallet {
    pub fn new(keypair: KeyPair, seed: &[u8], pledge: Option<Pledge>) -> Self {
        Self {
            profile: Profile {
                id: derive_node_id(seed),
                public_key: keypair.public_key(),
                keypair,
                pledge,
            },
        }
    }
}

impl Wallet for LocalWallet {
    fn profile(&self) -> Result<Profile, WalletError> {
        Ok(self.profile.clone())
    }
}

/// Pledge transaction lookup
#[async_trait]
pub trait Ledger: Send + Sync {
    /// `Ok(None)` when the reference does not resolve
    async fn resolve_pledge(
        &self,
        reference: &PledgeRef,
    ) -> Result<Option<TransactionRecord>, LedgerError>;
}

/// Ledger view held in memory, optionally seeded from a JSON snapshot
#[derive(Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<PledgeRef, TransactionRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of transaction records
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let file = std::fs::File::open(path)?;
        let records: Vec<TransactionRecord> = serde_json::from_reader(file)?;
        let ledger = Self::new();
        for record in records {
            ledger.insert(record);
        }
        Ok(ledger)
    }

    pub fn insert(&self, record: TransactionRecord) {
        self.records.write().insert(record.key, record);
    }

    pub fn get(&self, reference: &PledgeRef) -> Option<TransactionRecord> {
        self.records.read().get(reference).cloned()
    }

    /// Every pledge-type record, in no particular order
    pub fn pledges(&self) -> Vec<TransactionRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.tx_type == TxType::Pledge)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn resolve_pledge(
        &self,
        reference: &PledgeRef,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        Ok(self.get(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(key: u8, tx_type: TxType) -> TransactionRecord {
        TransactionRecord {
            key: PledgeRef([key; 32]),
            tx_type,
            public_key: [key; 32],
            space_pledged: 100,
            pledge_proof: [1; 32],
            pledge_interval: 3_600_000,
            created_at: 1000,
            seed: vec![key],
        }
    }

    #[test]
    fn test_wallet_profile_derives_id_from_seed() {
        let keypair = KeyPair::generate();
        let wallet = LocalWallet::new(keypair.clone(), b"abc", None);

        let profile = wallet.profile().unwrap();
        assert_eq!(profile.id, derive_node_id(b"abc"));
        assert_eq!(profile.public_key, keypair.public_key());
        assert!(matches!(profile.pledge(), Err(WalletError::NoPledge)));
    }

    #[tokio::test]
    async fn test_memory_ledger_resolves() {
        let ledger = MemoryLedger::new();
        ledger.insert(record(1, TxType::Pledge));
        ledger.insert(record(2, TxType::Other("credit".into())));

        let found = ledger.resolve_pledge(&PledgeRef([1; 32])).await.unwrap();
        assert_eq!(found.unwrap().space_pledged, 100);
        assert!(ledger
            .resolve_pledge(&PledgeRef([9; 32]))
            .await
            .unwrap()
            .is_none());
        assert_eq!(ledger.pledges().len(), 1);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_memory_ledger_from_snapshot() {
        let records = vec![record(1, TxType::Pledge), record(2, TxType::Pledge)];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&records).unwrap().as_bytes())
            .unwrap();

        let ledger = MemoryLedger::from_json_file(file.path()).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get(&PledgeRef([2; 32])), Some(records[1].clone()));
    }
}
