//! Persistent storage using sled

use crate::config::NodeState;
use sled::Db;
use std::path::Path;
use thiserror::Error;

const TABLE_KEY: &str = "lht";
const NODE_STATE_KEY: &str = "node_state";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Persistence of the serialized host table
pub trait TableStorage: Send + Sync {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;
    fn save(&self, table: &[u8]) -> Result<(), StorageError>;
}

/// Storage backend for trackerd
pub struct Storage {
    db: Db,
    /// Table tree: "lht" -> serialized EntryStore
    entries: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let entries = db.open_tree("entries")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            entries,
            metadata,
        })
    }

    /// Persisted node state, if any
    pub fn node_state(&self) -> Result<Option<NodeState>, StorageError> {
        match self.metadata.get(NODE_STATE_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_node_state(&self, state: &NodeState) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(state)?;
        self.metadata.insert(NODE_STATE_KEY, value)?;
        Ok(())
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl TableStorage for Storage {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(TABLE_KEY)?.map(|v| v.to_vec()))
    }

    fn save(&self, table: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(TABLE_KEY, table)?;
        Ok(())
    }
}
