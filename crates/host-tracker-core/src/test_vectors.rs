//! Test vectors for cross-implementation validation
//!
//! Every tracker on the network must derive identical node ids, entry hashes,
//! failure nonces and neighbor chains from identical inputs.

use crate::canonical::canonical_bytes;
use crate::crypto::*;
use crate::neighbors::select_neighbors;
use crate::types::*;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub canonical_bytes_hex: String,
    pub hash_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        node_id_vector(),
        entry_hash_vector(),
        failure_nonce_vector(),
        neighbor_chain_vector(),
        neighbor_selection_vector(),
    ]
}

fn node_id_vector() -> TestVector {
    let seed = "abc";
    let node_id = derive_node_id(seed.as_bytes());

    TestVector {
        name: "node_id_derivation".into(),
        description: "NodeId = BLAKE3(seed)".into(),
        inputs: serde_json::json!({ "seed": seed }),
        canonical_bytes_hex: hex::encode(seed.as_bytes()),
        hash_hex: node_id.to_hex(),
    }
}

fn entry_hash_vector() -> TestVector {
    let mut entry = Entry {
        hash: [0; 32],
        public_key: [0x11; 32],
        pledge_tx: PledgeRef([0x22; 32]),
        pledge: 100,
        proof_hash: [0x33; 32],
        public_ip: Some("1.2.3.4".parse().unwrap()),
        tcp_port: Some(9000),
        ws_port: Some(9001),
        is_gateway: false,
        created_at: 1000,
        updated_at: 2000,
        interval: 3_600_000,
        status: HostStatus::Active,
        uptime: 0,
        log: vec![],
    };
    entry.hash = compute_entry_hash(&entry).unwrap();

    TestVector {
        name: "entry_hash".into(),
        description: "hash = BLAKE3(\"entry\" || canonical_bytes(entry without hash))".into(),
        inputs: serde_json::json!({
            "public_key_hex": hex::encode(entry.public_key),
            "pledge_tx_hex": hex::encode(entry.pledge_tx.0),
            "pledge": entry.pledge,
            "public_ip": "1.2.3.4",
            "tcp_port": 9000,
            "ws_port": 9001,
            "created_at": entry.created_at,
            "updated_at": entry.updated_at,
            "status": "active",
        }),
        canonical_bytes_hex: hex::encode(entry_hash_bytes(&entry).unwrap()),
        hash_hex: hex::encode(entry.hash),
    }
}

fn failure_nonce_vector() -> TestVector {
    let target = derive_node_id(b"target");
    let sender = derive_node_id(b"sender");
    let timestamp = 1_700_000_000_000u64;
    let nonce = derive_failure_nonce(&target, &sender, timestamp);

    TestVector {
        name: "failure_nonce".into(),
        description: "nonce = BLAKE3(\"failure-nonce\" || target || sender || timestamp_le)".into(),
        inputs: serde_json::json!({
            "target_hex": target.to_hex(),
            "sender_hex": sender.to_hex(),
            "timestamp": timestamp,
        }),
        canonical_bytes_hex: "".into(), // N/A, raw concatenation
        hash_hex: hex::encode(nonce),
    }
}

fn neighbor_chain_vector() -> TestVector {
    let source = derive_node_id(b"abc");
    let first = next_neighbor_hash(&source.0);
    let second = next_neighbor_hash(&first);

    TestVector {
        name: "neighbor_hash_chain".into(),
        description: "h(i+1) = BLAKE3(\"neighbor\" || h(i)), h(0) = source".into(),
        inputs: serde_json::json!({
            "source_hex": source.to_hex(),
            "h1_hex": hex::encode(first),
        }),
        canonical_bytes_hex: "".into(),
        hash_hex: hex::encode(second),
    }
}

fn neighbor_selection_vector() -> TestVector {
    let ids: Vec<NodeId> = (0..17)
        .map(|i| derive_node_id(format!("host-{i}").as_bytes()))
        .collect();
    let source = ids[0];
    let selected = select_neighbors(&source, &ids[1..], 16, None).into_vec();
    let selected_hex: Vec<String> = selected.iter().map(NodeId::to_hex).collect();
    let bytes = canonical_bytes(&selected).unwrap();

    TestVector {
        name: "neighbor_selection".into(),
        description: "select_neighbors(host-0, host-1..host-16, table_len = 16)".into(),
        inputs: serde_json::json!({
            "source_seed": "host-0",
            "candidate_seeds": "host-1 .. host-16",
            "selected_hex": selected_hex,
        }),
        canonical_bytes_hex: hex::encode(&bytes),
        hash_hex: hex::encode(blake3::hash(&bytes).as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_vectors() {
        let vectors = generate_test_vectors();
        assert_eq!(vectors.len(), 5);

        // Print JSON for manual inspection / export
        let json = serde_json::to_string_pretty(&vectors).unwrap();
        println!("Test Vectors:\n{}", json);
    }

    #[test]
    fn test_entry_hash_deterministic() {
        let v1 = entry_hash_vector();
        let v2 = entry_hash_vector();
        assert_eq!(v1.hash_hex, v2.hash_hex);
    }

    #[test]
    fn test_entry_hash_vector_bytes_reproduce_hash() {
        let vector = entry_hash_vector();
        let bytes = hex::decode(&vector.canonical_bytes_hex).unwrap();

        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN_ENTRY);
        hasher.update(&bytes);
        assert_eq!(hex::encode(hasher.finalize().as_bytes()), vector.hash_hex);
    }

    #[test]
    fn test_neighbor_selection_deterministic() {
        let v1 = neighbor_selection_vector();
        let v2 = neighbor_selection_vector();
        assert_eq!(v1.hash_hex, v2.hash_hex);
    }
}
