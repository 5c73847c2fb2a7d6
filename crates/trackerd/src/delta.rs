//! Delta buffer: recently applied updates queued for outbound gossip

use host_tracker_core::crypto::derive_delta_key;
use host_tracker_core::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One flattened field of an update
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaValue {
    Text(String),
    Int(u64),
    Bool(bool),
    Null,
}

impl fmt::Display for DeltaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaValue::Text(s) => f.write_str(s),
            DeltaValue::Int(n) => write!(f, "{}", n),
            DeltaValue::Bool(b) => write!(f, "{}", b),
            DeltaValue::Null => Ok(()),
        }
    }
}

fn hex32(bytes: &Bytes32) -> DeltaValue {
    DeltaValue::Text(hex::encode(bytes))
}

fn opt_hex(bytes: &Option<Bytes32>) -> DeltaValue {
    bytes.as_ref().map(hex32).unwrap_or(DeltaValue::Null)
}

fn opt_sig(signature: &Option<Signature>) -> DeltaValue {
    signature
        .as_ref()
        .map(|s| DeltaValue::Text(hex::encode(s)))
        .unwrap_or(DeltaValue::Null)
}

fn join_values(values: &[DeltaValue]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Nested lists collapse to one digest of their flattened members
fn digest_of<T>(items: &[T], flatten: impl Fn(&T) -> Vec<DeltaValue>) -> DeltaValue {
    let joined = items
        .iter()
        .map(|item| join_values(&flatten(item)))
        .collect::<Vec<_>>()
        .join(";");
    DeltaValue::Text(hex::encode(blake3::hash(joined.as_bytes()).as_bytes()))
}

fn signature_object_fields(object: &SignatureObject) -> Vec<DeltaValue> {
    vec![
        hex32(&object.node_id.0),
        hex32(&object.public_key),
        hex32(&object.nonce),
        DeltaValue::Int(object.timestamp),
        opt_sig(&object.signature),
    ]
}

fn neighbor_proof_fields(proof: &NeighborProof) -> Vec<DeltaValue> {
    vec![
        hex32(&proof.host.0),
        hex32(&proof.neighbor.0),
        DeltaValue::Int(proof.timestamp),
        opt_sig(&proof.signature),
    ]
}

/// Flatten an update into its ordered field values (kind tag first).
pub fn flatten_update(update: &Update) -> Vec<DeltaValue> {
    let kind = DeltaValue::Text(update.kind().as_str().to_string());
    match update {
        Update::Join(join) => vec![
            kind,
            hex32(&join.node_id.0),
            hex32(&join.public_key),
            hex32(&join.pledge_tx.0),
            DeltaValue::Int(join.pledge),
            hex32(&join.proof_hash),
            DeltaValue::Text(join.public_ip.to_string()),
            DeltaValue::Int(join.tcp_port as u64),
            DeltaValue::Int(join.ws_port as u64),
            DeltaValue::Bool(join.is_gateway),
            DeltaValue::Int(join.timestamp),
            opt_sig(&join.signature),
            digest_of(&join.neighbor_proofs, neighbor_proof_fields),
        ],
        Update::Leave(leave) => vec![
            kind,
            hex32(&leave.node_id.0),
            opt_hex(&leave.previous),
            DeltaValue::Int(leave.timestamp),
            opt_sig(&leave.signature),
        ],
        Update::Failure(failure) => vec![
            kind,
            hex32(&failure.node_id.0),
            hex32(&failure.nonce),
            opt_hex(&failure.previous),
            DeltaValue::Int(failure.timestamp),
            digest_of(&failure.signatures, signature_object_fields),
        ],
        Update::Rejoin(rejoin) => vec![
            kind,
            hex32(&rejoin.node_id.0),
            opt_hex(&rejoin.previous),
            DeltaValue::Int(rejoin.timestamp),
            opt_sig(&rejoin.signature),
        ],
    }
}

/// Canonical (fields, key) pair identifying an update in the buffer.
pub fn canonicalize(update: &Update) -> (Vec<DeltaValue>, Bytes32) {
    let fields = flatten_update(update);
    let key = derive_delta_key(&join_values(&fields));
    (fields, key)
}

/// A buffered update
#[derive(Clone, Debug)]
pub struct Delta {
    pub fields: Vec<DeltaValue>,
    pub update: Update,
    /// Signed envelope the update arrived in, forwarded verbatim
    pub envelope: Option<HostMessage>,
}

/// Buffer keyed by canonical update hash
#[derive(Debug, Default)]
pub struct DeltaBuffer {
    deltas: HashMap<Bytes32, Delta>,
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a bare update
    pub fn add(&mut self, update: &Update) {
        let (fields, key) = canonicalize(update);
        self.deltas.insert(
            key,
            Delta {
                fields,
                update: update.clone(),
                envelope: None,
            },
        );
    }

    /// Buffer the update carried by a signed message. Returns false when the
    /// message carries no update.
    pub fn add_message(&mut self, message: &HostMessage) -> bool {
        let Some(update) = message.update() else {
            return false;
        };
        let (fields, key) = canonicalize(update);
        self.deltas.insert(
            key,
            Delta {
                fields,
                update: update.clone(),
                envelope: Some(message.clone()),
            },
        );
        true
    }

    /// Remove by canonical key; reports whether it was present
    pub fn remove(&mut self, update: &Update) -> bool {
        let (_, key) = canonicalize(update);
        self.deltas.remove(&key).is_some()
    }

    pub fn contains(&self, update: &Update) -> bool {
        let (_, key) = canonicalize(update);
        self.deltas.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Flattened fields of every buffered update (unordered)
    pub fn drain(&self) -> Vec<Vec<DeltaValue>> {
        self.deltas.values().map(|d| d.fields.clone()).collect()
    }

    /// Signed envelopes to forward (unordered)
    pub fn envelopes(&self) -> Vec<HostMessage> {
        self.deltas
            .values()
            .filter_map(|d| d.envelope.clone())
            .collect()
    }

    /// Empty the buffer after a successful gossip round
    pub fn clear(&mut self) {
        self.deltas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leave(node: u8, timestamp: u64) -> Update {
        Update::Leave(LeaveUpdate {
            node_id: NodeId([node; 32]),
            previous: None,
            timestamp,
            signature: Some(vec![1, 2, 3]),
        })
    }

    fn failure(signers: &[u8]) -> Update {
        Update::Failure(FailureUpdate {
            node_id: NodeId([1; 32]),
            nonce: [2; 32],
            previous: None,
            timestamp: 10,
            signatures: signers
                .iter()
                .map(|s| SignatureObject {
                    node_id: NodeId([1; 32]),
                    public_key: [*s; 32],
                    nonce: [2; 32],
                    timestamp: 10,
                    signature: None,
                })
                .collect(),
        })
    }

    #[test]
    fn test_add_contains_remove() {
        let mut buffer = DeltaBuffer::new();
        let update = leave(1, 100);

        assert!(buffer.is_empty());
        buffer.add(&update);
        assert!(buffer.contains(&update));
        assert!(!buffer.contains(&leave(1, 101)));

        assert!(buffer.remove(&update));
        assert!(!buffer.contains(&update));
        assert!(!buffer.remove(&update));
    }

    #[test]
    fn test_same_update_buffers_once() {
        let mut buffer = DeltaBuffer::new();
        buffer.add(&leave(1, 100));
        buffer.add(&leave(1, 100));
        buffer.add(&leave(2, 100));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.drain().len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flatten_order() {
        let fields = flatten_update(&leave(1, 100));
        assert_eq!(fields[0], DeltaValue::Text("leave".into()));
        assert_eq!(fields[2], DeltaValue::Null);
        assert_eq!(fields[3], DeltaValue::Int(100));
        assert_eq!(fields[4], DeltaValue::Text("010203".into()));
    }

    #[test]
    fn test_failure_signers_change_key() {
        let (_, two) = canonicalize(&failure(&[3, 4]));
        let (_, three) = canonicalize(&failure(&[3, 4, 5]));
        assert_ne!(two, three);
    }

    #[test]
    fn test_add_message_keeps_envelope() {
        let mut buffer = DeltaBuffer::new();
        let message = HostMessage {
            version: PROTOCOL_VERSION,
            message_type: MessageType::HostLeave,
            timestamp: 100,
            sender: NodeId([1; 32]),
            public_key: [1; 32],
            data: MessageData::Update(leave(1, 100)),
            signature: Some(vec![9]),
        };

        assert!(buffer.add_message(&message));
        assert!(buffer.contains(&leave(1, 100)));
        assert_eq!(buffer.envelopes(), vec![message]);

        let request = HostMessage {
            data: MessageData::NeighborRequest(PledgeRef([0; 32])),
            ..HostMessage {
                version: PROTOCOL_VERSION,
                message_type: MessageType::NeighborRequest,
                timestamp: 1,
                sender: NodeId([1; 32]),
                public_key: [1; 32],
                data: MessageData::Update(leave(1, 1)),
                signature: None,
            }
        };
        assert!(!buffer.add_message(&request));
    }
}
