//! Canonical encoding for tracker records
//!
//! All hashed/signed objects use postcard serialization with strict constraints:
//! - No maps/hashmaps
//! - Neighbor proofs must be sorted by neighbor id and deduped
//! - Signature lists keep insertion order (the proposer signs first)
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Sort and dedup the neighbor proofs of a join before it is signed.
pub fn normalize_neighbor_proofs(proofs: &mut Vec<NeighborProof>) {
    proofs.sort_by(|a, b| a.neighbor.cmp(&b.neighbor));
    proofs.dedup_by(|a, b| a.neighbor == b.neighbor);
}

/// Check that neighbor proofs are strictly ordered by neighbor id.
pub fn validate_neighbor_proofs_sorted(proofs: &[NeighborProof]) -> Result<()> {
    for i in 1..proofs.len() {
        if proofs[i].neighbor <= proofs[i - 1].neighbor {
            return Err(Error::UnsortedRepeatedField {
                field: "neighbor_proofs".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(neighbor: u8) -> NeighborProof {
        NeighborProof {
            host: NodeId([0; 32]),
            neighbor: NodeId([neighbor; 32]),
            timestamp: 1,
            signature: None,
        }
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let update = Update::Rejoin(RejoinUpdate {
            node_id: NodeId([9; 32]),
            previous: None,
            timestamp: 1234,
            signature: None,
        });

        let bytes1 = canonical_bytes(&update).unwrap();
        let bytes2 = canonical_bytes(&update).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_neighbor_proof_sorting() {
        let mut proofs = vec![proof(3), proof(1), proof(3), proof(2)];
        assert!(validate_neighbor_proofs_sorted(&proofs).is_err());

        normalize_neighbor_proofs(&mut proofs);
        assert_eq!(proofs.len(), 3);
        assert!(validate_neighbor_proofs_sorted(&proofs).is_ok());
    }
}
