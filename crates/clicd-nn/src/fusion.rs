//! Attention fusion of per-sample views.
//!
//! For `V` stacked views `x: (V, N, H)`:
//!
//! ```text
//! score[v, n] = ((x[v, n] @ W) * a).sum()
//! out[n]      = Σ_v softmax_v(score)[v, n] * x[v, n]
//! ```

use crate::{Error, Result};
use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};

pub struct ViewFusion {
    /// Bilinear projection, `(H, H)`.
    weights: Tensor,
    /// Learned query, `(1, H)`.
    query: Tensor,
}

impl ViewFusion {
    pub fn new(hidden: usize, init_std: f64, vb: VarBuilder) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.0,
            stdev: init_std,
        };
        Ok(Self {
            weights: vb.get_with_hints((hidden, hidden), "attn_weights", init)?,
            query: vb.get_with_hints((1, hidden), "attn", init)?,
        })
    }

    /// Softmax attention over views, `(V, N)`.
    pub fn view_scores(&self, stacked: &Tensor) -> Result<Tensor> {
        let (v, n, h) = stacked.dims3()?;
        let projected = stacked.reshape((v * n, h))?.matmul(&self.weights)?.reshape((v, n, h))?;
        let logits = projected.broadcast_mul(&self.query)?.sum(D::Minus1)?;
        Ok(candle_nn::ops::softmax(&logits, 0)?)
    }

    /// Fuse equally shaped `(N, H)` views into one `(N, H)` representation.
    pub fn forward(&self, views: &[&Tensor]) -> Result<Tensor> {
        if views.is_empty() {
            return Err(Error::DimensionMismatch { expected: 1, got: 0 });
        }
        let stacked = Tensor::stack(views, 0)?;
        let scores = self.view_scores(&stacked)?.unsqueeze(D::Minus1)?;
        Ok(stacked.broadcast_mul(&scores)?.sum(0)?)
    }
}
