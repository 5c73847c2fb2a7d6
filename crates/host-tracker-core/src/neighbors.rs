//! XOR-distance neighbor selection
//!
//! Every peer runs the same deterministic function over its own snapshot of
//! node identifiers, so peers holding the same table converge on the same
//! overlay without coordination.
//!
//! Closeness is the XOR of two 32-byte identifiers compared byte-wise as a
//! big-endian unsigned integer. On equal distance the candidate that appears
//! first in the input order wins.

use crate::crypto::next_neighbor_hash;
use crate::types::{Bytes32, NodeId};

/// Lower bound for the neighbor count of [`select_neighbors`]
pub const MIN_NEIGHBORS: usize = 4;

/// Default lower bound for [`select_host_neighbors`]
pub const DEFAULT_MIN_HOST_NEIGHBORS: usize = 3;

/// Neighbors chosen for a source node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighborSet {
    /// Peers the source connects to, in selection order
    pub direct: Vec<NodeId>,
    /// Peers expected to connect to the source, in discovery order
    pub indirect: Vec<NodeId>,
}

impl NeighborSet {
    pub fn len(&self) -> usize {
        self.direct.len() + self.indirect.len()
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.indirect.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.direct.contains(id) || self.indirect.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.direct.iter().chain(self.indirect.iter())
    }

    /// Direct neighbors first, then indirect
    pub fn into_vec(self) -> Vec<NodeId> {
        let mut all = self.direct;
        all.extend(self.indirect);
        all
    }
}

/// XOR distance between two identifiers
#[inline]
pub fn xor_distance(a: &Bytes32, b: &Bytes32) -> Bytes32 {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Index of the candidate XOR-closest to `target`; ties keep the earliest.
pub fn closest_index(target: &Bytes32, candidates: &[NodeId]) -> Option<usize> {
    let mut best: Option<(usize, Bytes32)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let distance = xor_distance(target, &candidate.0);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((i, distance)),
        }
    }
    best.map(|(i, _)| i)
}

/// Default neighbor count: `round(log2(table_len))`, at least
/// [`MIN_NEIGHBORS`], at most `total`.
pub fn neighbor_count(table_len: usize, total: usize) -> usize {
    let log = if table_len == 0 {
        0
    } else {
        (table_len as f64).log2().round() as usize
    };
    log.max(MIN_NEIGHBORS).min(total)
}

fn dedup_in_order(ids: &[NodeId]) -> Vec<NodeId> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Pick the XOR-closest pool member for `rounds` successive hashes of `hashed`,
/// sampling without replacement. Returns the last hash of the chain.
fn pick_along_chain(
    mut hashed: Bytes32,
    rounds: usize,
    pool: &mut Vec<NodeId>,
    out: &mut Vec<NodeId>,
) -> Bytes32 {
    for _ in 0..rounds {
        hashed = next_neighbor_hash(&hashed);
        match closest_index(&hashed, pool) {
            Some(i) => out.push(pool.remove(i)),
            None => break,
        }
    }
    hashed
}

/// Select the overlay neighbors of `source` among `candidates`.
///
/// The first half are direct picks along the source's own hash chain. The
/// second half are candidates whose hash chain lands closest to the source
/// (searched `half` levels deep); slots still open after that search are
/// filled by extending the source's chain. The source itself is never
/// returned.
pub fn select_neighbors(
    source: &NodeId,
    candidates: &[NodeId],
    table_len: usize,
    count: Option<usize>,
) -> NeighborSet {
    let all = dedup_in_order(candidates);
    let total = all.len();

    let mut pool: Vec<NodeId> = all.iter().copied().filter(|id| id != source).collect();
    let n = match count {
        Some(count) => count.min(total),
        None => neighbor_count(table_len, total),
    }
    .min(pool.len());
    let half = n / 2;

    let mut matchable = all;
    if !matchable.contains(source) {
        matchable.push(*source);
    }

    let mut direct = Vec::with_capacity(half);
    let chain = pick_along_chain(source.0, half, &mut pool, &mut direct);

    let wanted = n - direct.len();
    let mut indirect = Vec::with_capacity(wanted);
    let mut remaining: Vec<(NodeId, Bytes32)> = pool.iter().map(|id| (*id, id.0)).collect();

    'levels: for _ in 0..half {
        if indirect.len() >= wanted {
            break;
        }
        for slot in remaining.iter_mut() {
            slot.1 = next_neighbor_hash(&slot.1);
        }

        let mut i = 0;
        while i < remaining.len() {
            let (candidate, hashed) = remaining[i];
            let lands_on_source = closest_index(&hashed, &matchable)
                .map(|j| matchable[j] == *source)
                .unwrap_or(false);

            if lands_on_source {
                indirect.push(candidate);
                remaining.remove(i);
                if indirect.len() == wanted {
                    break 'levels;
                }
            } else {
                i += 1;
            }
        }
    }

    if indirect.len() < wanted {
        pool.retain(|id| !indirect.contains(id));
        let open = wanted - indirect.len();
        pick_along_chain(chain, open, &mut pool, &mut indirect);
    }

    NeighborSet { direct, indirect }
}

/// Select only the direct-connect neighbors of `host_id` among active hosts.
///
/// With `min_count` or fewer active hosts every other host is returned.
/// Otherwise `max(min_count, floor(log2(active)))` hosts are picked along the
/// host's hash chain.
pub fn select_host_neighbors(
    host_id: &NodeId,
    active_hosts: &[NodeId],
    min_count: usize,
) -> Vec<NodeId> {
    let hosts = dedup_in_order(active_hosts);
    let mut pool: Vec<NodeId> = hosts.iter().copied().filter(|id| id != host_id).collect();

    if hosts.len() <= min_count {
        return pool;
    }

    let rounds = min_count.max((hosts.len() as f64).log2().floor() as usize);
    let mut selected = Vec::with_capacity(rounds);
    pick_along_chain(host_id.0, rounds, &mut pool, &mut selected);
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_node_id;
    use std::collections::HashSet;

    fn ids(count: usize) -> Vec<NodeId> {
        (0..count)
            .map(|i| derive_node_id(format!("host-{i}").as_bytes()))
            .collect()
    }

    fn assert_unique(set: &[NodeId]) {
        let unique: HashSet<_> = set.iter().collect();
        assert_eq!(unique.len(), set.len());
    }

    #[test]
    fn test_xor_distance() {
        let mut a = [0u8; 32];
        a[0] = 0b1010_1010;
        let mut b = [0u8; 32];
        b[0] = 0b0101_0101;

        let dist = xor_distance(&a, &b);
        assert_eq!(dist[0], 0b1111_1111);
        assert!(dist.iter().skip(1).all(|byte| *byte == 0));
    }

    #[test]
    fn test_closest_tie_keeps_first() {
        let target = [0u8; 32];
        let candidates = vec![NodeId([9; 32]), NodeId([1; 32]), NodeId([1; 32])];
        assert_eq!(closest_index(&target, &candidates), Some(1));
        assert_eq!(closest_index(&target, &[]), None);
    }

    #[test]
    fn test_neighbor_count_bounds() {
        assert_eq!(neighbor_count(16, 16), 4);
        assert_eq!(neighbor_count(1024, 2000), 10);
        assert_eq!(neighbor_count(2, 10), MIN_NEIGHBORS);
        assert_eq!(neighbor_count(0, 10), MIN_NEIGHBORS);
        assert_eq!(neighbor_count(1024, 3), 3);
    }

    #[test]
    fn test_sixteen_hosts_yield_two_direct_two_indirect() {
        let all = ids(17);
        let source = all[0];
        let candidates = &all[1..];

        let set = select_neighbors(&source, candidates, 16, None);
        assert_eq!(set.direct.len(), 2);
        assert_eq!(set.indirect.len(), 2);
        assert!(!set.contains(&source));
        assert_unique(&set.clone().into_vec());
    }

    #[test]
    fn test_source_in_candidates_is_excluded() {
        let all = ids(16);
        let source = all[5];

        let set = select_neighbors(&source, &all, all.len(), None);
        assert_eq!(set.len(), 4);
        assert!(!set.contains(&source));
    }

    #[test]
    fn test_count_matches_for_many_sizes() {
        for k in 4..48 {
            let all = ids(k + 1);
            let source = all[k];
            let candidates = &all[..k];

            let set = select_neighbors(&source, candidates, k, None);
            assert_eq!(set.len(), neighbor_count(k, k), "k = {k}");
            assert!(!set.contains(&source));
            assert_unique(&set.into_vec());
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let all = ids(40);
        let source = all[0];

        let a = select_neighbors(&source, &all[1..], 40, None);
        let b = select_neighbors(&source, &all[1..], 40, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_direct_half_follows_hash_chain() {
        let all = ids(20);
        let source = all[0];
        let candidates = all[1..].to_vec();

        let set = select_neighbors(&source, &candidates, 20, None);
        let first_hash = next_neighbor_hash(&source.0);
        let expected = candidates[closest_index(&first_hash, &candidates).unwrap()];
        assert_eq!(set.direct[0], expected);
    }

    #[test]
    fn test_explicit_count_is_capped() {
        let all = ids(6);
        let set = select_neighbors(&all[0], &all[1..], 6, Some(50));
        assert_eq!(set.len(), 5);

        let set = select_neighbors(&all[0], &all[1..], 6, Some(1));
        assert_eq!(set.len(), 1);
        assert!(set.direct.is_empty());
    }

    #[test]
    fn test_duplicate_candidates_are_collapsed() {
        let all = ids(8);
        let mut candidates = all[1..].to_vec();
        candidates.extend_from_slice(&all[1..]);

        let set = select_neighbors(&all[0], &candidates, 8, None);
        assert_eq!(set.len(), 4);
        assert_unique(&set.into_vec());
    }

    #[test]
    fn test_host_neighbors_small_network_returns_others() {
        let all = ids(3);
        let selected = select_host_neighbors(&all[0], &all, DEFAULT_MIN_HOST_NEIGHBORS);
        assert_eq!(selected, vec![all[1], all[2]]);
    }

    #[test]
    fn test_host_neighbors_uses_log2_rounds() {
        let all = ids(64);
        let selected = select_host_neighbors(&all[0], &all, DEFAULT_MIN_HOST_NEIGHBORS);
        assert_eq!(selected.len(), 6);
        assert!(!selected.contains(&all[0]));
        assert_unique(&selected);

        let again = select_host_neighbors(&all[0], &all, DEFAULT_MIN_HOST_NEIGHBORS);
        assert_eq!(selected, again);
    }

    #[test]
    fn test_host_neighbors_minimum_applies() {
        let all = ids(5);
        let selected = select_host_neighbors(&all[0], &all, DEFAULT_MIN_HOST_NEIGHBORS);
        assert_eq!(selected.len(), 3);
    }
}
