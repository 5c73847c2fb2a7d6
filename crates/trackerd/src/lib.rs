//! trackerd - Local Host Table membership tracker
//!
//! This daemon provides:
//! - The Local Host Table of pledged hosts and their activity history
//! - Signed join/leave/rejoin/failure message construction and validation
//! - Multi-signature failure consensus with quorum and deadline
//! - A delta buffer drained to overlay neighbors on every gossip round
//! - Periodic persistence of the table

pub mod collaborators;
pub mod config;
pub mod delta;
pub mod entry_store;
pub mod failure;
pub mod protocol;
pub mod server;
pub mod storage;

pub use collaborators::{Ledger, LocalWallet, MemoryLedger, Wallet};
pub use config::Config;
pub use delta::DeltaBuffer;
pub use entry_store::EntryStore;
pub use protocol::{MessageOutcome, Tracker, TrackerEvent, Validation};
pub use server::{GossipBatch, Server};
pub use storage::{Storage, TableStorage};
