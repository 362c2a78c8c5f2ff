//! The external data bundle consumed by the CLICD model, and builders that
//! derive it from user sequences.

use crate::{Error, ItemGraph, Result, UserEdgeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Persistent graphs plus the per-user edge table used for augmentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalData {
    /// Co-occurrence counts between consecutive items.
    pub adjacency: ItemGraph,
    /// Top-k item-item cosine similarity over user behavior.
    pub similarity: ItemGraph,
    /// Each user's own adjacency edges.
    pub user_edges: UserEdgeIndex,
}

impl ExternalData {
    pub fn new(adjacency: ItemGraph, similarity: ItemGraph, user_edges: UserEdgeIndex) -> Result<Self> {
        if adjacency.node_count() != similarity.node_count() {
            return Err(Error::InvalidConfig(format!(
                "adjacency graph has {} nodes, similarity graph has {}",
                adjacency.node_count(),
                similarity.node_count()
            )));
        }
        Ok(Self {
            adjacency,
            similarity,
            user_edges,
        })
    }

    /// Build every component from `user -> item sequence` histories.
    pub fn from_sequences(num_items: usize, sequences: &BTreeMap<u32, Vec<u32>>, sim_top_k: usize) -> Result<Self> {
        let (adjacency, user_edges) = cooccurrence_graph(num_items, sequences)?;
        let similarity = similarity_graph(num_items, sequences, sim_top_k)?;
        Self::new(adjacency, similarity, user_edges)
    }

    pub fn num_items(&self) -> usize {
        self.adjacency.node_count()
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    #[cfg(feature = "binary")]
    pub fn save_binary(&self, path: impl AsRef<Path>) -> Result<()> {
        bincode::serialize_into(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    #[cfg(feature = "binary")]
    pub fn load_binary(path: impl AsRef<Path>) -> Result<Self> {
        Ok(bincode::deserialize_from(BufReader::new(File::open(path)?))?)
    }
}

/// Group sequences by user. When a user appears more than once the last
/// sequence wins (later batch rows carry longer prefixes).
pub fn collect_user_sequences(user_ids: &[u32], sequences: &[Vec<u32>]) -> BTreeMap<u32, Vec<u32>> {
    user_ids
        .iter()
        .zip(sequences)
        .map(|(u, s)| (*u, s.iter().copied().filter(|i| *i != 0).collect()))
        .collect()
}

/// Directed co-occurrence graph over consecutive items, and the per-user
/// edge lists that produced it. Self-transitions and padding are skipped.
pub fn cooccurrence_graph(
    num_items: usize,
    sequences: &BTreeMap<u32, Vec<u32>>,
) -> Result<(ItemGraph, UserEdgeIndex)> {
    let mut graph = ItemGraph::new(num_items);
    let mut index = UserEdgeIndex::new();
    for (&user, seq) in sequences {
        let pairs: Vec<(u32, u32)> = seq
            .windows(2)
            .map(|w| (w[0], w[1]))
            .filter(|(a, b)| *a != 0 && *b != 0 && a != b)
            .collect();
        for &(a, b) in &pairs {
            graph.add_edge(a, b, 1.0)?;
        }
        index.insert(user, pairs);
    }
    Ok((graph, index))
}

/// Item-item cosine similarity of user incidence vectors, keeping the
/// `top_k` most similar items per item (ties broken by lower id).
pub fn similarity_graph(num_items: usize, sequences: &BTreeMap<u32, Vec<u32>>, top_k: usize) -> Result<ItemGraph> {
    let mut item_users = vec![0usize; num_items];
    let mut co_users: HashMap<(u32, u32), usize> = HashMap::new();
    for seq in sequences.values() {
        let mut items: Vec<u32> = seq.iter().copied().filter(|i| *i != 0).collect();
        items.sort_unstable();
        items.dedup();
        for (k, &a) in items.iter().enumerate() {
            let slot = item_users
                .get_mut(a as usize)
                .ok_or(Error::UnknownNode { node: a, num_nodes: num_items })?;
            *slot += 1;
            for &b in &items[k + 1..] {
                *co_users.entry((a, b)).or_default() += 1;
            }
        }
    }

    let mut candidates: Vec<Vec<(u32, f32)>> = vec![Vec::new(); num_items];
    for (&(a, b), &count) in &co_users {
        let sim = count as f32 / ((item_users[a as usize] * item_users[b as usize]) as f32).sqrt();
        candidates[a as usize].push((b, sim));
        candidates[b as usize].push((a, sim));
    }

    let mut graph = ItemGraph::new(num_items);
    for (src, mut cands) in candidates.into_iter().enumerate() {
        cands.sort_by(|x, y| y.1.total_cmp(&x.1).then(x.0.cmp(&y.0)));
        for (dst, sim) in cands.into_iter().take(top_k) {
            graph.add_edge(src as u32, dst, sim)?;
        }
    }
    Ok(graph)
}

/// For each user, the `k` other users with the most similar item sets
/// (cosine over multi-hot vectors). Users sharing no items are not listed.
pub fn build_user_similarity(sequences: &BTreeMap<u32, Vec<u32>>, k: usize) -> BTreeMap<u32, Vec<u32>> {
    let mut item_to_users: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut sizes: HashMap<u32, usize> = HashMap::new();
    for (&user, seq) in sequences {
        let mut items: Vec<u32> = seq.iter().copied().filter(|i| *i != 0).collect();
        items.sort_unstable();
        items.dedup();
        sizes.insert(user, items.len());
        for item in items {
            item_to_users.entry(item).or_default().push(user);
        }
    }

    let mut result = BTreeMap::new();
    for (&user, seq) in sequences {
        let mut overlap: HashMap<u32, usize> = HashMap::new();
        let mut items: Vec<u32> = seq.iter().copied().filter(|i| *i != 0).collect();
        items.sort_unstable();
        items.dedup();
        for item in &items {
            for &other in item_to_users.get(item).map_or(&[][..], Vec::as_slice) {
                if other != user {
                    *overlap.entry(other).or_default() += 1;
                }
            }
        }
        let own = sizes.get(&user).copied().unwrap_or(0).max(1) as f32;
        let mut scored: Vec<(u32, f32)> = overlap
            .into_iter()
            .map(|(other, c)| {
                let theirs = sizes.get(&other).copied().unwrap_or(0).max(1) as f32;
                (other, c as f32 / (own * theirs).sqrt())
            })
            .collect();
        scored.sort_by(|x, y| y.1.total_cmp(&x.1).then(x.0.cmp(&y.0)));
        result.insert(user, scored.into_iter().take(k).map(|(u, _)| u).collect());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histories() -> BTreeMap<u32, Vec<u32>> {
        BTreeMap::from([
            (1, vec![1, 2, 3, 2]),
            (2, vec![2, 3, 4]),
            (3, vec![5, 1]),
        ])
    }

    #[test]
    fn test_cooccurrence_counts_and_user_edges() {
        let (g, idx) = cooccurrence_graph(6, &histories()).unwrap();
        let w = g.edge_weight(g.find_edge(2, 3).unwrap()).unwrap();
        assert_eq!(w, 2.0);
        assert!(g.has_edge(3, 2));
        assert_eq!(idx.edges_of(3), &[(5, 1)]);
        assert!(idx.edges_of(99).is_empty());
    }

    #[test]
    fn test_similarity_top_k() {
        let g = similarity_graph(6, &histories(), 1).unwrap();
        // Items 2 and 3 are both consumed by users 1 and 2: cosine 1.0.
        assert_eq!(g.out_neighbors(2).unwrap(), vec![3]);
        assert_eq!(g.out_neighbors(3).unwrap(), vec![2]);
        assert!(g.out_neighbors(0).unwrap().is_empty());
    }

    #[test]
    fn test_user_similarity_excludes_self() {
        let sims = build_user_similarity(&histories(), 5);
        assert_eq!(sims[&1], vec![2, 3]);
        assert!(!sims[&2].contains(&2));
    }

    #[test]
    fn test_collect_user_sequences_last_wins() {
        let out = collect_user_sequences(&[4, 4, 5], &[vec![1, 0], vec![1, 2, 0], vec![3]]);
        assert_eq!(out[&4], vec![1, 2]);
        assert_eq!(out[&5], vec![3]);
    }

    #[test]
    fn test_bundle_rejects_mismatched_graphs() {
        let err = ExternalData::new(ItemGraph::new(3), ItemGraph::new(4), UserEdgeIndex::new());
        assert!(err.is_err());
    }
}
