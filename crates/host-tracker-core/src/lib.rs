//! Host Tracker Core Library
//!
//! This crate provides the core types, canonical encoding, hash derivations
//! and neighbor selection for the Local Host Table (LHT) membership tracker.
//!
//! # Modules
//!
//! - [`types`]: Table entries, updates and the signed `HostMessage` envelope
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Hash derivations, Ed25519 keys and the `Crypto` collaborator
//! - [`neighbors`]: XOR-distance neighbor selection over node identifiers
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod neighbors;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use crypto::{Crypto, KeyPair, StdCrypto};
pub use error::{Error, Result};
pub use neighbors::{select_host_neighbors, select_neighbors, NeighborSet};
pub use types::*;
