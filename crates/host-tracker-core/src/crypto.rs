//! Hash derivations and signing for the host tracker
//!
//! All hash derivations use BLAKE3, with domain separation prefixes everywhere
//! except the node identifier (which is the bare hash of the pledge seed).
//! Signatures are Ed25519 over `domain || canonical_bytes(unsigned value)`.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for entry hashes
pub const DOMAIN_ENTRY: &[u8] = b"entry";
/// Domain prefix for iterative neighbor hashing
pub const DOMAIN_NEIGHBOR: &[u8] = b"neighbor";
/// Domain prefix for failure nonces
pub const DOMAIN_FAILURE_NONCE: &[u8] = b"failure-nonce";
/// Domain prefix for delta keys
pub const DOMAIN_DELTA: &[u8] = b"delta";
/// Domain prefix for envelope signatures
pub const DOMAIN_HOST_MSG: &[u8] = b"host-msg";
/// Domain prefix for join update signatures
pub const DOMAIN_JOIN_SIG: &[u8] = b"join-sig";
/// Domain prefix for leave update signatures
pub const DOMAIN_LEAVE_SIG: &[u8] = b"leave-sig";
/// Domain prefix for rejoin update signatures
pub const DOMAIN_REJOIN_SIG: &[u8] = b"rejoin-sig";
/// Domain prefix for failure attestations
pub const DOMAIN_FAILURE_SIG: &[u8] = b"failure-sig";
/// Domain prefix for neighbor proofs
pub const DOMAIN_NEIGHBOR_PROOF: &[u8] = b"neighbor-proof";

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Derive a node identifier from the declared pledge seed.
///
/// `NodeId = BLAKE3(seed)`
pub fn derive_node_id(seed: &[u8]) -> NodeId {
    NodeId(*blake3::hash(seed).as_bytes())
}

/// One step of the iterative neighbor hash chain.
///
/// `next = BLAKE3("neighbor" || previous)`
pub fn next_neighbor_hash(previous: &Bytes32) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_NEIGHBOR);
    hasher.update(previous);
    *hasher.finalize().as_bytes()
}

/// Derive the nonce binding a failure proposal to target, proposer and time.
///
/// `nonce = BLAKE3("failure-nonce" || target || sender || timestamp_le)`
pub fn derive_failure_nonce(target: &NodeId, sender: &NodeId, timestamp: u64) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_FAILURE_NONCE);
    hasher.update(&target.0);
    hasher.update(&sender.0);
    hasher.update(&timestamp.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Derive the delta buffer key from an update's flattened string form.
pub fn derive_delta_key(flattened: &str) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_DELTA);
    hasher.update(flattened.as_bytes());
    *hasher.finalize().as_bytes()
}

// =============================================================================
// ENTRY HASH
// =============================================================================

/// Canonical bytes of every entry field except `hash` itself.
pub fn entry_hash_bytes(entry: &Entry) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct EntryHashable<'a> {
        public_key: &'a Bytes32,
        pledge_tx: &'a PledgeRef,
        pledge: u64,
        proof_hash: &'a Bytes32,
        public_ip: &'a Option<std::net::IpAddr>,
        tcp_port: Option<u16>,
        ws_port: Option<u16>,
        is_gateway: bool,
        created_at: u64,
        updated_at: u64,
        interval: u64,
        status: HostStatus,
        uptime: u64,
        log: &'a [Update],
    }

    let hashable = EntryHashable {
        public_key: &entry.public_key,
        pledge_tx: &entry.pledge_tx,
        pledge: entry.pledge,
        proof_hash: &entry.proof_hash,
        public_ip: &entry.public_ip,
        tcp_port: entry.tcp_port,
        ws_port: entry.ws_port,
        is_gateway: entry.is_gateway,
        created_at: entry.created_at,
        updated_at: entry.updated_at,
        interval: entry.interval,
        status: entry.status,
        uptime: entry.uptime,
        log: &entry.log,
    };

    canonical_bytes(&hashable)
}

/// Compute an entry's hash over [`entry_hash_bytes`].
pub fn compute_entry_hash(entry: &Entry) -> Result<Bytes32> {
    let bytes = entry_hash_bytes(entry)?;
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_ENTRY);
    hasher.update(&bytes);
    Ok(*hasher.finalize().as_bytes())
}

/// Verify that an entry's stored hash matches its fields.
pub fn verify_entry_hash(entry: &Entry) -> Result<()> {
    let computed = compute_entry_hash(entry)?;
    if computed != entry.hash {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed),
            stored: hex::encode(entry.hash),
        });
    }
    Ok(())
}

// =============================================================================
// SIGN BYTES
// =============================================================================

fn sign_bytes<T: Serialize>(domain: &[u8], value: &T) -> Result<Vec<u8>> {
    let body = canonical_bytes(value)?;
    let mut bytes = Vec::with_capacity(domain.len() + body.len());
    bytes.extend_from_slice(domain);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// `"host-msg" || canonical_bytes(message with signature = None)`
pub fn message_sign_bytes(message: &HostMessage) -> Result<Vec<u8>> {
    sign_bytes(DOMAIN_HOST_MSG, &message.unsigned())
}

pub fn join_sign_bytes(join: &JoinUpdate) -> Result<Vec<u8>> {
    let unsigned = JoinUpdate {
        signature: None,
        ..join.clone()
    };
    sign_bytes(DOMAIN_JOIN_SIG, &unsigned)
}

pub fn leave_sign_bytes(leave: &LeaveUpdate) -> Result<Vec<u8>> {
    let unsigned = LeaveUpdate {
        signature: None,
        ..leave.clone()
    };
    sign_bytes(DOMAIN_LEAVE_SIG, &unsigned)
}

pub fn rejoin_sign_bytes(rejoin: &RejoinUpdate) -> Result<Vec<u8>> {
    let unsigned = RejoinUpdate {
        signature: None,
        ..rejoin.clone()
    };
    sign_bytes(DOMAIN_REJOIN_SIG, &unsigned)
}

pub fn signature_object_sign_bytes(object: &SignatureObject) -> Result<Vec<u8>> {
    let unsigned = SignatureObject {
        signature: None,
        ..object.clone()
    };
    sign_bytes(DOMAIN_FAILURE_SIG, &unsigned)
}

pub fn neighbor_proof_sign_bytes(proof: &NeighborProof) -> Result<Vec<u8>> {
    let unsigned = NeighborProof {
        signature: None,
        ..proof.clone()
    };
    sign_bytes(DOMAIN_NEIGHBOR_PROOF, &unsigned)
}

// =============================================================================
// KEYS
// =============================================================================

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for persistence and deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Secret seed bytes
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> Bytes32 {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Verify a signature
    pub fn verify(public_key: &Bytes32, message: &[u8], signature: &[u8]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        let sig = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| Error::InvalidSignature)?;
        verifying_key
            .verify(message, &sig)
            .map_err(|_| Error::InvalidSignature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(&self.public_key()[..8]))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CRYPTO COLLABORATOR
// =============================================================================

/// Cryptographic collaborator consulted by the membership protocol.
pub trait Crypto: Send + Sync {
    fn hash(&self, data: &[u8]) -> Bytes32 {
        *blake3::hash(data).as_bytes()
    }

    fn sign(&self, payload: &[u8], keypair: &KeyPair) -> Signature;

    fn verify(&self, payload: &[u8], signature: &[u8], public_key: &Bytes32) -> bool;

    /// Current unix time in milliseconds
    fn now_millis(&self) -> u64;

    /// `|now - timestamp| <= window_ms`
    fn is_within_time_window(&self, timestamp: u64, window_ms: u64) -> bool {
        self.now_millis().abs_diff(timestamp) <= window_ms
    }
}

/// BLAKE3 + Ed25519 + system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct StdCrypto;

impl Crypto for StdCrypto {
    fn sign(&self, payload: &[u8], keypair: &KeyPair) -> Signature {
        keypair.sign(payload)
    }

    fn verify(&self, payload: &[u8], signature: &[u8], public_key: &Bytes32) -> bool {
        KeyPair::verify(public_key, payload, signature).is_ok()
    }

    fn now_millis(&self) -> u64 {
        now_millis()
    }
}
