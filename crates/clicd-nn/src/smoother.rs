//! Two-hop, weight-free GCN smoothing with stochastic edge dropout.
//!
//! ```text
//! E_out = (E + Â E + Â² E) / 3
//! ```
//!
//! This is LightGCN's layer combination with K = 2 and no learned
//! transform. During training `Â` is built from a dropped-out copy of the
//! edge weights; the graph's own weights are restored before any tensor
//! work happens.

use crate::propagate::SparsePropagation;
use crate::{Error, Result};
use candle_core::Tensor;
use clicd_core::{with_edge_dropout, ItemGraph};
use rand::Rng;

/// Hops averaged with the input.
const NUM_HOPS: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct GcnSmoother {
    keep_prob: f32,
}

impl GcnSmoother {
    /// `dropout_prob` is the fraction of edges zeroed per training call.
    pub fn new(dropout_prob: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&dropout_prob) {
            return Err(Error::InvalidConfig(format!(
                "graph dropout probability must be in [0, 1), got {dropout_prob}"
            )));
        }
        Ok(Self {
            keep_prob: 1.0 - dropout_prob,
        })
    }

    pub fn keep_prob(&self) -> f32 {
        self.keep_prob
    }

    /// Smooth `x` (one row per graph node) over `graph`.
    ///
    /// Edges are dropped only when `train` is set; inference always smooths
    /// over the full graph, so evaluation scores are deterministic.
    /// `graph` leaves this call with exactly the weights it entered with.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        graph: &mut ItemGraph,
        x: &Tensor,
        rng: &mut R,
        train: bool,
    ) -> Result<Tensor> {
        let prop = if train && self.keep_prob < 1.0 {
            with_edge_dropout(graph, self.keep_prob, rng, |dropped| {
                Ok::<_, Error>(SparsePropagation::from_graph(dropped))
            })?
        } else {
            SparsePropagation::from_graph(graph)
        };

        let mut hop = x.clone();
        let mut acc = x.clone();
        for _ in 0..NUM_HOPS {
            hop = prop.apply(&hop)?;
            acc = (acc + &hop)?;
        }
        Ok(acc.affine(1.0 / (NUM_HOPS + 1) as f64, 0.0)?)
    }
}
