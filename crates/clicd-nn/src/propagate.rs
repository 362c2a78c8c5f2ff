//! Weight-free sparse graph propagation as a candle custom op.
//!
//! Computes `out[dst] += c(src, dst) * x[src]` for every edge, where the
//! coefficient is the edge weight scaled by symmetric degree normalization
//! (see [`ItemGraph::normalized_edges`]). Backward applies the same edge list
//! with source and destination swapped.
//!
//! ```text
//! H' = D_in^{-1/2} A^T D_out^{-1/2} H      (A weighted, degrees counted)
//! ```
//!
//! Only contiguous `f32` CPU tensors are supported.

use crate::{Error, Result};
use candle_core::{CpuStorage, CustomOp1, Layout, Shape, Tensor};
use clicd_core::ItemGraph;
use std::sync::Arc;

/// One propagation step over a frozen copy of a graph's edge coefficients.
#[derive(Debug, Clone)]
pub struct SparsePropagation {
    num_nodes: usize,
    edges: Arc<Vec<(u32, u32, f32)>>,
    transposed: bool,
}

impl SparsePropagation {
    /// Capture the normalized coefficients of `graph` as they are now.
    pub fn from_graph(graph: &ItemGraph) -> Self {
        Self {
            num_nodes: graph.node_count(),
            edges: Arc::new(graph.normalized_edges()),
            transposed: false,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn transpose(&self) -> Self {
        Self {
            num_nodes: self.num_nodes,
            edges: Arc::clone(&self.edges),
            transposed: !self.transposed,
        }
    }

    /// Propagate node features `x` of shape `(num_nodes, H)`.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (rows, _) = x.dims2()?;
        if rows != self.num_nodes {
            return Err(Error::DimensionMismatch {
                expected: self.num_nodes,
                got: rows,
            });
        }
        Ok(x.contiguous()?.apply_op1(self.clone())?)
    }
}

impl CustomOp1 for SparsePropagation {
    fn name(&self) -> &'static str {
        "sparse-propagation"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        let (rows, dim) = layout.shape().dims2()?;
        let Some((start, end)) = layout.contiguous_offsets() else {
            candle_core::bail!("sparse-propagation requires a contiguous input")
        };
        let x = match storage {
            CpuStorage::F32(v) => &v[start..end],
            _ => candle_core::bail!("sparse-propagation only supports f32"),
        };

        let mut out = vec![0f32; rows * dim];
        for &(src, dst, coef) in self.edges.iter() {
            if coef == 0.0 {
                continue;
            }
            let (from, to) = if self.transposed { (dst, src) } else { (src, dst) };
            let from = &x[from as usize * dim..(from as usize + 1) * dim];
            let to = &mut out[to as usize * dim..(to as usize + 1) * dim];
            for (o, v) in to.iter_mut().zip(from) {
                *o += coef * v;
            }
        }
        Ok((CpuStorage::F32(out), Shape::from((rows, dim))))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> candle_core::Result<Option<Tensor>> {
        let grad = grad_res.contiguous()?.apply_op1_no_bwd(&self.transpose())?;
        Ok(Some(grad))
    }
}
