use crate::{Error, Result};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A weighted, directed graph over item ids.
///
/// Node `i` is item id `i`, so the node count equals the item count
/// (padding id 0 included). Edge weights are co-occurrence strengths or
/// similarity scores depending on how the graph was built.
///
/// Edge indices are stable between structural changes, which is what
/// [`graph_dropout`](crate::graph_dropout) relies on to snapshot and
/// restore weights.
///
/// # Example
///
/// ```rust
/// use clicd_core::ItemGraph;
///
/// let mut g = ItemGraph::new(4);
/// g.add_edge(1, 2, 1.0).unwrap();
/// g.add_edge(1, 3, 2.0).unwrap();
/// g.add_edge(1, 2, 1.0).unwrap(); // accumulates
///
/// assert_eq!(g.edge_count(), 2);
/// assert_eq!(g.out_neighbors(1).unwrap(), vec![2, 3]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemGraph {
    graph: DiGraph<(), f32>,
}

impl ItemGraph {
    /// Create a graph with `num_nodes` isolated nodes.
    pub fn new(num_nodes: usize) -> Self {
        let mut graph = DiGraph::with_capacity(num_nodes, 0);
        for _ in 0..num_nodes {
            graph.add_node(());
        }
        Self { graph }
    }

    /// Build from `(src, dst, weight)` triples; duplicates accumulate.
    pub fn from_edges<I>(num_nodes: usize, edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, u32, f32)>,
    {
        let mut g = Self::new(num_nodes);
        for (src, dst, w) in edges {
            g.add_edge(src, dst, w)?;
        }
        Ok(g)
    }

    /// Append isolated nodes until the graph has at least `num_nodes`.
    pub fn ensure_nodes(&mut self, num_nodes: usize) {
        while self.graph.node_count() < num_nodes {
            self.graph.add_node(());
        }
    }

    fn node(&self, id: u32) -> Result<NodeIndex> {
        if (id as usize) < self.graph.node_count() {
            Ok(NodeIndex::new(id as usize))
        } else {
            Err(Error::UnknownNode {
                node: id,
                num_nodes: self.graph.node_count(),
            })
        }
    }

    /// Add `weight` to the edge `src -> dst`, creating it if needed.
    pub fn add_edge(&mut self, src: u32, dst: u32, weight: f32) -> Result<()> {
        let (s, d) = (self.node(src)?, self.node(dst)?);
        match self.graph.find_edge(s, d) {
            Some(e) => self.graph[e] += weight,
            None => {
                self.graph.add_edge(s, d, weight);
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Edge index of `src -> dst`, if present.
    pub fn find_edge(&self, src: u32, dst: u32) -> Option<usize> {
        let (s, d) = (self.node(src).ok()?, self.node(dst).ok()?);
        self.graph.find_edge(s, d).map(EdgeIndex::index)
    }

    pub fn has_edge(&self, src: u32, dst: u32) -> bool {
        self.find_edge(src, dst).is_some()
    }

    pub fn edge_weight(&self, edge: usize) -> Option<f32> {
        self.graph.edge_weight(EdgeIndex::new(edge)).copied()
    }

    /// Overwrite one edge weight. Out-of-range indices are ignored.
    pub fn set_edge_weight(&mut self, edge: usize, weight: f32) {
        if let Some(w) = self.graph.edge_weight_mut(EdgeIndex::new(edge)) {
            *w = weight;
        }
    }

    /// All edge weights ordered by edge index.
    pub fn edge_weights(&self) -> Vec<f32> {
        self.graph.edge_weights().copied().collect()
    }

    /// Replace all edge weights; `weights` must have one entry per edge.
    pub fn set_edge_weights(&mut self, weights: &[f32]) -> Result<()> {
        if weights.len() != self.edge_count() {
            return Err(Error::InvalidConfig(format!(
                "expected {} edge weights, got {}",
                self.edge_count(),
                weights.len()
            )));
        }
        for (slot, w) in self.graph.edge_weights_mut().zip(weights) {
            *slot = *w;
        }
        Ok(())
    }

    /// Sorted out-neighbors of `node`.
    pub fn out_neighbors(&self, node: u32) -> Result<Vec<u32>> {
        let idx = self.node(node)?;
        let mut out: Vec<u32> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| n.index() as u32)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    pub fn out_degree(&self, node: u32) -> Result<usize> {
        let idx = self.node(node)?;
        Ok(self.graph.edges_directed(idx, Direction::Outgoing).count())
    }

    pub fn in_degree(&self, node: u32) -> Result<usize> {
        let idx = self.node(node)?;
        Ok(self.graph.edges_directed(idx, Direction::Incoming).count())
    }

    /// `(src, dst, weight)` for every edge, in edge-index order.
    pub fn edges(&self) -> impl Iterator<Item = (u32, u32, f32)> + '_ {
        self.graph
            .edge_references()
            .map(|e| (e.source().index() as u32, e.target().index() as u32, *e.weight()))
    }

    /// Remove every listed `(src, dst)` edge that exists. Returns how many were removed.
    pub fn remove_edges<I>(&mut self, pairs: I) -> usize
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let doomed: HashSet<(u32, u32)> = pairs.into_iter().collect();
        if doomed.is_empty() {
            return 0;
        }
        let before = self.graph.edge_count();
        self.graph.retain_edges(|g, e| {
            g.edge_endpoints(e).map_or(true, |(s, d)| {
                !doomed.contains(&(s.index() as u32, d.index() as u32))
            })
        });
        before - self.graph.edge_count()
    }

    /// Edges with symmetric degree normalization applied to their weights:
    /// `w / sqrt(max(out_deg(src), 1) * max(in_deg(dst), 1))`.
    ///
    /// Degrees count edges, not weights, so zeroed edges still participate
    /// in normalization (dropout scales messages, not the graph structure).
    pub fn normalized_edges(&self) -> Vec<(u32, u32, f32)> {
        let n = self.node_count();
        let mut out_deg = vec![0usize; n];
        let mut in_deg = vec![0usize; n];
        for e in self.graph.edge_references() {
            out_deg[e.source().index()] += 1;
            in_deg[e.target().index()] += 1;
        }
        self.edges()
            .map(|(s, d, w)| {
                let norm = (out_deg[s as usize].max(1) * in_deg[d as usize].max(1)) as f32;
                (s, d, w / norm.sqrt())
            })
            .collect()
    }

    /// Underlying petgraph graph.
    pub fn as_petgraph(&self) -> &DiGraph<(), f32> {
        &self.graph
    }

    /// Save as JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Load from JSON.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Save to binary format (bincode).
    #[cfg(feature = "binary")]
    pub fn save_binary(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// Load from binary format (bincode).
    #[cfg(feature = "binary")]
    pub fn load_binary(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> ItemGraph {
        ItemGraph::from_edges(4, [(1, 2, 1.0), (2, 3, 2.0), (3, 1, 3.0), (1, 3, 0.5)]).unwrap()
    }

    #[test]
    fn test_duplicate_edges_accumulate() {
        let mut g = ItemGraph::new(3);
        g.add_edge(1, 2, 1.0).unwrap();
        g.add_edge(1, 2, 2.5).unwrap();
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.edge_weights(), vec![3.5]);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let mut g = ItemGraph::new(3);
        assert!(matches!(g.add_edge(1, 7, 1.0), Err(Error::UnknownNode { node: 7, .. })));
        assert!(g.out_neighbors(9).is_err());
    }

    #[test]
    fn test_neighbors_and_degrees() {
        let g = triangle();
        assert_eq!(g.out_neighbors(1).unwrap(), vec![2, 3]);
        assert_eq!(g.out_neighbors(0).unwrap(), Vec::<u32>::new());
        assert_eq!(g.in_degree(3).unwrap(), 2);
        assert_eq!(g.out_degree(3).unwrap(), 1);
    }

    #[test]
    fn test_remove_edges_ignores_missing_pairs() {
        let mut g = triangle();
        let removed = g.remove_edges([(1, 2), (2, 1), (0, 3)]);
        assert_eq!(removed, 1);
        assert!(!g.has_edge(1, 2));
        assert!(g.has_edge(1, 3));
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn test_set_edge_weights_length_checked() {
        let mut g = triangle();
        assert!(g.set_edge_weights(&[1.0]).is_err());
        g.set_edge_weights(&[0.0; 4]).unwrap();
        assert!(g.edge_weights().iter().all(|w| *w == 0.0));
    }

    #[test]
    fn test_normalized_edges() {
        let g = triangle();
        let norm = g.normalized_edges();
        // 1 -> 3: out_deg(1) = 2, in_deg(3) = 2
        let (_, _, w) = norm.iter().find(|(s, d, _)| (*s, *d) == (1, 3)).copied().unwrap();
        assert!((w - 0.5 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_json_round_trip() {
        let g = triangle();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.json");
        g.save_json(&path).unwrap();
        let back = ItemGraph::load_json(&path).unwrap();
        assert_eq!(back.edge_weights(), g.edge_weights());
        assert_eq!(back.node_count(), 4);
    }
}
