//! Core tracker types (LHT entries, updates, wire envelope)
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding. Serde field names follow the
//! camelCase wire form so the same types also serialize as JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// 32-byte fixed-size array used for hashes, keys and identifiers.
pub type Bytes32 = [u8; 32];

/// Detached Ed25519 signature bytes.
pub type Signature = Vec<u8>;

/// Envelope version emitted by this implementation.
pub const PROTOCOL_VERSION: u32 = 0;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Node identifier: BLAKE3(seed) of the host's declared pledge seed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub Bytes32);

impl NodeId {
    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// Full lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Reference to a pledge transaction on the ledger
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PledgeRef(pub Bytes32);

impl fmt::Display for PledgeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// =============================================================================
// LEDGER VIEW
// =============================================================================

/// Ledger transaction type as seen by the tracker
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Pledge,
    Other(String),
}

/// Resolved ledger transaction backing a host's pledge
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Ledger key of this transaction
    pub key: PledgeRef,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub public_key: Bytes32,
    pub space_pledged: u64,
    pub pledge_proof: Bytes32,
    pub pledge_interval: u64,
    pub created_at: u64,
    /// Declared identity seed (NodeId = BLAKE3(seed))
    pub seed: Vec<u8>,
}

/// A host's own pledge, as held by its wallet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pledge {
    pub tx: PledgeRef,
    pub size: u64,
    pub proof: Bytes32,
    pub interval: u64,
}

// =============================================================================
// UPDATES
// =============================================================================

/// Proof that `neighbor` recognizes `host` as an overlay neighbor.
/// Signed by the neighbor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NeighborProof {
    pub host: NodeId,
    pub neighbor: NodeId,
    pub timestamp: u64,
    pub signature: Option<Signature>,
}

/// One neighbor's attestation within a Failure update
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureObject {
    /// Target (failed) node
    pub node_id: NodeId,
    /// Signer's public key
    pub public_key: Bytes32,
    pub nonce: Bytes32,
    pub timestamp: u64,
    pub signature: Option<Signature>,
}

/// Host announces itself active with fresh endpoints
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinUpdate {
    pub node_id: NodeId,
    pub public_key: Bytes32,
    pub pledge_tx: PledgeRef,
    pub pledge: u64,
    pub proof_hash: Bytes32,
    pub public_ip: IpAddr,
    pub tcp_port: u16,
    pub ws_port: u16,
    pub is_gateway: bool,
    pub timestamp: u64,
    pub signature: Option<Signature>,
    /// MUST be sorted by neighbor id and deduped before signing
    pub neighbor_proofs: Vec<NeighborProof>,
}

/// Host announces a graceful departure
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveUpdate {
    pub node_id: NodeId,
    pub previous: Option<Bytes32>,
    pub timestamp: u64,
    pub signature: Option<Signature>,
}

/// Neighbors jointly declare a host failed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureUpdate {
    pub node_id: NodeId,
    pub nonce: Bytes32,
    pub previous: Option<Bytes32>,
    pub timestamp: u64,
    pub signatures: Vec<SignatureObject>,
}

/// Legacy reactivation without endpoint refresh
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RejoinUpdate {
    pub node_id: NodeId,
    pub previous: Option<Bytes32>,
    pub timestamp: u64,
    pub signature: Option<Signature>,
}

/// Update discriminant
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UpdateKind {
    Join = 0,
    Leave = 1,
    Failure = 2,
    Rejoin = 3,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Join => "join",
            UpdateKind::Leave => "leave",
            UpdateKind::Failure => "failure",
            UpdateKind::Rejoin => "rejoin",
        }
    }
}

/// Union of all update variants applied to the table
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Update {
    Join(JoinUpdate),
    Leave(LeaveUpdate),
    Failure(FailureUpdate),
    Rejoin(RejoinUpdate),
}

impl Update {
    /// Node the update refers to
    pub fn node_id(&self) -> NodeId {
        match self {
            Update::Join(u) => u.node_id,
            Update::Leave(u) => u.node_id,
            Update::Failure(u) => u.node_id,
            Update::Rejoin(u) => u.node_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Update::Join(u) => u.timestamp,
            Update::Leave(u) => u.timestamp,
            Update::Failure(u) => u.timestamp,
            Update::Rejoin(u) => u.timestamp,
        }
    }

    pub fn kind(&self) -> UpdateKind {
        match self {
            Update::Join(_) => UpdateKind::Join,
            Update::Leave(_) => UpdateKind::Leave,
            Update::Failure(_) => UpdateKind::Failure,
            Update::Rejoin(_) => UpdateKind::Rejoin,
        }
    }

    /// Leave and Failure take a host offline
    pub fn deactivates(&self) -> bool {
        matches!(self, Update::Leave(_) | Update::Failure(_))
    }
}

// =============================================================================
// LOCAL HOST TABLE ENTRY
// =============================================================================

/// Host activity status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HostStatus {
    #[default]
    Inactive,
    Active,
}

impl HostStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, HostStatus::Active)
    }
}

/// One row of the Local Host Table
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// BLAKE3("entry" || canonical_bytes(entry without hash))
    pub hash: Bytes32,
    pub public_key: Bytes32,
    pub pledge_tx: PledgeRef,
    pub pledge: u64,
    pub proof_hash: Bytes32,
    pub public_ip: Option<IpAddr>,
    pub tcp_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub is_gateway: bool,
    /// When the pledge starts (unix millis)
    pub created_at: u64,
    /// Last applied update (unix millis)
    pub updated_at: u64,
    /// Pledge renewal interval (millis)
    pub interval: u64,
    pub status: HostStatus,
    /// Cumulative active time (millis)
    pub uptime: u64,
    /// Every update ever applied, in order
    pub log: Vec<Update>,
}

// =============================================================================
// WIRE ENVELOPE
// =============================================================================

/// Envelope type (wire strings are kebab-case)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    #[serde(rename = "host-join")]
    HostJoin,
    #[serde(rename = "host-leave")]
    HostLeave,
    #[serde(rename = "host-failure")]
    HostFailure,
    #[serde(rename = "pending-failure-request")]
    PendingFailureRequest,
    #[serde(rename = "neighbor-request")]
    NeighborRequest,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::HostJoin => "host-join",
            MessageType::HostLeave => "host-leave",
            MessageType::HostFailure => "host-failure",
            MessageType::PendingFailureRequest => "pending-failure-request",
            MessageType::NeighborRequest => "neighbor-request",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope payload
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MessageData {
    Update(Update),
    /// Pre-join admission request referencing the sender's pledge
    NeighborRequest(PledgeRef),
}

/// Signed gossip envelope.
/// The signature covers canonical_bytes(message with signature = None).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostMessage {
    pub version: u32,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: u64,
    pub sender: NodeId,
    pub public_key: Bytes32,
    pub data: MessageData,
    pub signature: Option<Signature>,
}

impl HostMessage {
    /// The carried update, if any
    pub fn update(&self) -> Option<&Update> {
        match &self.data {
            MessageData::Update(update) => Some(update),
            MessageData::NeighborRequest(_) => None,
        }
    }

    /// Copy of this message with the signature cleared
    pub fn unsigned(&self) -> Self {
        Self {
            signature: None,
            ..self.clone()
        }
    }
}
