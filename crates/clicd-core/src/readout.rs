//! Mean-pooled neighbor readouts.
//!
//! A readout turns a list of query nodes into a [`PoolingPlan`]: one row per
//! query, holding the neighbor ids to average. Applying the plan to a feature
//! matrix gathers and averages those rows with ordinary tensor ops, so the
//! result stays differentiable with respect to the features.
//!
//! Rows with no neighbors pool to the zero vector.

use crate::{Error, ItemGraph, Result};
use candle_core::{Tensor, D};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

/// Neighbor cap applied to each civil and foreign set in the dual readout.
pub const MAX_READOUT_NEIGHBORS: usize = 10;

/// Which neighbors each output row averages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolingPlan {
    num_nodes: usize,
    rows: Vec<Vec<u32>>,
}

impl PoolingPlan {
    pub fn new(num_nodes: usize, rows: Vec<Vec<u32>>) -> Self {
        Self { num_nodes, rows }
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Mean of the selected feature rows, shape `(num_rows, H)`.
    ///
    /// `features` must be `(num_nodes, H)`.
    pub fn apply(&self, features: &Tensor) -> Result<Tensor> {
        let (n, hidden) = features.dims2()?;
        if n != self.num_nodes {
            return Err(Error::InvalidBatch(format!(
                "readout features have {n} rows, graph has {} nodes",
                self.num_nodes
            )));
        }
        let b = self.rows.len();
        if b == 0 {
            return Ok(Tensor::zeros((0, hidden), features.dtype(), features.device())?);
        }
        let width = self.rows.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut index = Vec::with_capacity(b * width);
        let mut weight = Vec::with_capacity(b * width);
        for row in &self.rows {
            let scale = if row.is_empty() { 0.0 } else { 1.0 / row.len() as f32 };
            for j in 0..width {
                match row.get(j) {
                    Some(&node) => {
                        index.push(node);
                        weight.push(scale);
                    }
                    None => {
                        index.push(0);
                        weight.push(0.0);
                    }
                }
            }
        }

        let device = features.device();
        let index = Tensor::from_vec(index, b * width, device)?;
        let weight = Tensor::from_vec(weight, (b, width, 1), device)?.to_dtype(features.dtype())?;
        let gathered = features.index_select(&index, 0)?.reshape((b, width, hidden))?;
        Ok(gathered.broadcast_mul(&weight)?.sum(D::Minus2)?)
    }
}

/// Plan averaging each node's out-neighbors.
pub fn neighbor_plan(graph: &ItemGraph, node_ids: &[u32]) -> Result<PoolingPlan> {
    let rows = node_ids
        .iter()
        .map(|&n| graph.out_neighbors(n))
        .collect::<Result<Vec<_>>>()?;
    Ok(PoolingPlan::new(graph.node_count(), rows))
}

/// Row `i` is the mean of `features` over the out-neighbors of `node_ids[i]`,
/// or zeros when that node has none.
pub fn graph_neighbor_readout(graph: &ItemGraph, node_ids: &[u32], features: &Tensor) -> Result<Tensor> {
    neighbor_plan(graph, node_ids)?.apply(features)
}

/// Civil and foreign plans for the dual readout.
#[derive(Debug, Clone)]
pub struct DualPlan {
    /// Base-graph neighbors that are not neighbors in the augmented view.
    pub civil: PoolingPlan,
    /// Neighbors in the augmented view.
    pub foreign: PoolingPlan,
}

/// Civil and foreign readouts, row-aligned with the queried nodes.
#[derive(Debug, Clone)]
pub struct DualReadout {
    pub civil: Tensor,
    pub foreign: Tensor,
}

/// Partition each node's neighbors into civil and foreign sets, each capped at
/// [`MAX_READOUT_NEIGHBORS`] by uniform sampling without replacement.
pub fn dual_plan<R: Rng + ?Sized>(
    base: &ItemGraph,
    augmented: &ItemGraph,
    node_ids: &[u32],
    rng: &mut R,
) -> Result<DualPlan> {
    if base.node_count() != augmented.node_count() {
        return Err(Error::InvalidConfig(format!(
            "base graph has {} nodes, augmented graph has {}",
            base.node_count(),
            augmented.node_count()
        )));
    }
    let mut civil = Vec::with_capacity(node_ids.len());
    let mut foreign = Vec::with_capacity(node_ids.len());
    for &node in node_ids {
        let foreign_all = augmented.out_neighbors(node)?;
        let foreign_set: HashSet<u32> = foreign_all.iter().copied().collect();
        let civil_all: Vec<u32> = base
            .out_neighbors(node)?
            .into_iter()
            .filter(|n| !foreign_set.contains(n))
            .collect();
        foreign.push(cap_neighbors(foreign_all, MAX_READOUT_NEIGHBORS, rng));
        civil.push(cap_neighbors(civil_all, MAX_READOUT_NEIGHBORS, rng));
    }
    Ok(DualPlan {
        civil: PoolingPlan::new(base.node_count(), civil),
        foreign: PoolingPlan::new(base.node_count(), foreign),
    })
}

/// Dual readout over `features`; see [`dual_plan`].
pub fn graph_dual_neighbor_readout<R: Rng + ?Sized>(
    base: &ItemGraph,
    augmented: &ItemGraph,
    node_ids: &[u32],
    features: &Tensor,
    rng: &mut R,
) -> Result<DualReadout> {
    let plan = dual_plan(base, augmented, node_ids, rng)?;
    Ok(DualReadout {
        civil: plan.civil.apply(features)?,
        foreign: plan.foreign.apply(features)?,
    })
}

/// Keep at most `k` neighbors, sampled uniformly without replacement.
///
/// # Complexity
/// O(min(k, degree))
fn cap_neighbors<R: Rng + ?Sized>(neighbors: Vec<u32>, k: usize, rng: &mut R) -> Vec<u32> {
    if neighbors.len() <= k {
        return neighbors;
    }
    let mut sampled: Vec<u32> = neighbors.choose_multiple(rng, k).copied().collect();
    sampled.sort_unstable();
    sampled
}
