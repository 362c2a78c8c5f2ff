//! Graph augmentation: per-batch edge removal, random edge dropout, targeted
//! masking, and a scoped guard that undoes dropout on every exit path.
//!
//! | Operation | Mutates input? | Result |
//! |-----------|----------------|--------|
//! | [`graph_augment`] | no | copy without the batch users' edges |
//! | [`graph_mask`] | no | copy with listed edge weights zeroed |
//! | [`graph_dropout`] | yes | original weights, graph zeroed in place |
//! | [`EdgeDropoutGuard`] | yes, restored on drop | dropped graph view |

use crate::{Error, ItemGraph, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Deref;

/// Per-user list of `(src_item, dst_item)` edges, precomputed from history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserEdgeIndex {
    edges: HashMap<u32, Vec<(u32, u32)>>,
}

impl UserEdgeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `pairs` to `user`'s edge list.
    pub fn insert(&mut self, user: u32, pairs: impl IntoIterator<Item = (u32, u32)>) {
        self.edges.entry(user).or_default().extend(pairs);
    }

    /// Edges recorded for `user`; empty for unknown users.
    pub fn edges_of(&self, user: u32) -> &[(u32, u32)] {
        self.edges.get(&user).map_or(&[], Vec::as_slice)
    }

    pub fn num_users(&self) -> usize {
        self.edges.len()
    }

    pub fn users(&self) -> impl Iterator<Item = u32> + '_ {
        self.edges.keys().copied()
    }
}

/// Copy `base` and remove every edge recorded for the given users.
///
/// Users with no recorded edges, and recorded pairs absent from `base`,
/// contribute nothing. `base` is never touched.
#[must_use]
pub fn graph_augment(base: &ItemGraph, user_ids: &[u32], index: &UserEdgeIndex) -> ItemGraph {
    let pairs: HashSet<(u32, u32)> = user_ids
        .iter()
        .flat_map(|u| index.edges_of(*u).iter().copied())
        .collect();
    let mut augmented = base.clone();
    let removed = augmented.remove_edges(pairs);
    tracing::trace!(users = user_ids.len(), removed, "augmented graph");
    augmented
}

/// Zero `round((1 - keep_prob) * E)` distinct, uniformly chosen edges in place.
///
/// Returns the weights as they were before the call. The caller owns
/// restoring them; prefer [`EdgeDropoutGuard`] or [`with_edge_dropout`],
/// which do it automatically.
pub fn graph_dropout<R: Rng + ?Sized>(
    graph: &mut ItemGraph,
    keep_prob: f32,
    rng: &mut R,
) -> Result<Vec<f32>> {
    if !(keep_prob > 0.0 && keep_prob <= 1.0) {
        return Err(Error::InvalidConfig(format!(
            "keep probability must be in (0, 1], got {keep_prob}"
        )));
    }
    let original = graph.edge_weights();
    let total = original.len();
    let n_drop = (((1.0 - f64::from(keep_prob)) * total as f64).round() as usize).min(total);
    for edge in rand::seq::index::sample(rng, total, n_drop).iter() {
        graph.set_edge_weight(edge, 0.0);
    }
    Ok(original)
}

/// Copy `graph` with the listed `(src, dst)` edges' weights set to zero.
#[must_use]
pub fn graph_mask(graph: &ItemGraph, pairs: &[(u32, u32)]) -> ItemGraph {
    let mut masked = graph.clone();
    for &(src, dst) in pairs {
        if let Some(edge) = masked.find_edge(src, dst) {
            masked.set_edge_weight(edge, 0.0);
        }
    }
    masked
}

/// Edge dropout scoped to a borrow.
///
/// Construction snapshots the weights and applies [`graph_dropout`]; dropping
/// the guard writes the snapshot back, whether the scope ends normally, via
/// `?`, or by unwinding.
///
/// ```rust
/// use clicd_core::{EdgeDropoutGuard, ItemGraph};
/// use rand::SeedableRng;
///
/// let mut g = ItemGraph::from_edges(3, [(0, 1, 1.0), (1, 2, 1.0)]).unwrap();
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// {
///     let dropped = EdgeDropoutGuard::new(&mut g, 0.5, &mut rng).unwrap();
///     assert_eq!(dropped.edge_weights().iter().filter(|w| **w == 0.0).count(), 1);
/// }
/// assert_eq!(g.edge_weights(), vec![1.0, 1.0]);
/// ```
pub struct EdgeDropoutGuard<'g> {
    graph: &'g mut ItemGraph,
    original: Vec<f32>,
}

impl<'g> EdgeDropoutGuard<'g> {
    pub fn new<R: Rng + ?Sized>(graph: &'g mut ItemGraph, keep_prob: f32, rng: &mut R) -> Result<Self> {
        let original = graph_dropout(graph, keep_prob, rng)?;
        Ok(Self { graph, original })
    }

    /// Weights captured before dropout.
    pub fn original_weights(&self) -> &[f32] {
        &self.original
    }
}

impl Deref for EdgeDropoutGuard<'_> {
    type Target = ItemGraph;

    fn deref(&self) -> &ItemGraph {
        self.graph
    }
}

impl Drop for EdgeDropoutGuard<'_> {
    fn drop(&mut self) {
        // Structure is frozen while borrowed, so lengths always agree.
        if self.graph.set_edge_weights(&self.original).is_err() {
            tracing::error!("edge count changed under dropout guard; weights not restored");
        }
    }
}

/// Run `f` on `graph` with edge dropout applied, restoring weights afterwards.
pub fn with_edge_dropout<R, F, T, E>(
    graph: &mut ItemGraph,
    keep_prob: f32,
    rng: &mut R,
    f: F,
) -> std::result::Result<T, E>
where
    R: Rng + ?Sized,
    F: FnOnce(&ItemGraph) -> std::result::Result<T, E>,
    E: From<Error>,
{
    let guard = EdgeDropoutGuard::new(graph, keep_prob, rng)?;
    f(&*guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn chain(n: u32) -> ItemGraph {
        ItemGraph::from_edges(n as usize, (0..n - 1).map(|i| (i, i + 1, 1.0 + i as f32))).unwrap()
    }

    #[test]
    fn test_augment_removes_user_edges_only() {
        let base = chain(6);
        let mut index = UserEdgeIndex::new();
        index.insert(7, [(1, 2), (3, 4)]);
        index.insert(8, [(4, 5)]);

        let aug = graph_augment(&base, &[7], &index);
        assert_eq!(aug.edge_count(), 3);
        assert!(!aug.has_edge(1, 2));
        assert!(aug.has_edge(4, 5));
        assert_eq!(base.edge_count(), 5);
    }

    #[test]
    fn test_augment_unknown_user_is_noop() {
        let base = chain(4);
        let aug = graph_augment(&base, &[42], &UserEdgeIndex::new());
        assert_eq!(aug.edge_weights(), base.edge_weights());
    }

    #[test]
    fn test_dropout_count_uses_rounding() {
        let mut g = chain(6); // 5 edges
        let mut rng = StdRng::seed_from_u64(1);
        let original = graph_dropout(&mut g, 0.7, &mut rng).unwrap();
        // round(0.3 * 5) = round(1.5) = 2
        assert_eq!(g.edge_weights().iter().filter(|w| **w == 0.0).count(), 2);
        assert_eq!(original, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_dropout_rejects_bad_keep_prob() {
        let mut g = chain(3);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(graph_dropout(&mut g, 0.0, &mut rng).is_err());
        assert!(graph_dropout(&mut g, 1.5, &mut rng).is_err());
        assert!(graph_dropout(&mut g, 1.0, &mut rng).is_ok());
    }

    #[test]
    fn test_mask_is_copy() {
        let g = chain(4);
        let masked = graph_mask(&g, &[(0, 1), (2, 0)]);
        assert_eq!(masked.edge_weights(), vec![0.0, 2.0, 3.0]);
        assert_eq!(g.edge_weights(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_guard_restores_on_error_path() {
        let mut g = chain(5);
        let before = g.edge_weights();
        let mut rng = StdRng::seed_from_u64(3);
        let res: std::result::Result<(), Error> = with_edge_dropout(&mut g, 0.25, &mut rng, |dropped| {
            assert!(dropped.edge_weights().iter().any(|w| *w == 0.0));
            Err(Error::InvalidBatch("boom".into()))
        });
        assert!(res.is_err());
        assert_eq!(g.edge_weights(), before);
    }
}
