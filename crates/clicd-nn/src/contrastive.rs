//! Two-view contrastive objectives.
//!
//! Every loss here takes two `(B, H)` views where row `i` of each is a
//! positive pair, and returns a per-sample `(B,)` vector so callers can
//! weight samples before reducing. Views pass through a shared two-layer
//! ELU projection head and are compared by cosine similarity over a
//! temperature `tau`.

use crate::encoder::normal_linear;
use crate::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

const NORM_EPS: f64 = 1e-12;

pub struct ContrastiveLayer {
    fc1: Linear,
    fc2: Linear,
    tau: f64,
}

impl ContrastiveLayer {
    pub fn new(hidden: usize, tau: f64, init_std: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: normal_linear(hidden, hidden, init_std, vb.pp("fc1"))?,
            fc2: normal_linear(hidden, hidden, init_std, vb.pp("fc2"))?,
            tau,
        })
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    fn project(&self, z: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(z)?.elu(1.0)?;
        Ok(self.fc2.forward(&h)?)
    }

    /// Cosine similarity matrix scaled by `1 / tau`.
    fn sim(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let a = l2_normalize(a)?;
        let b = l2_normalize(b)?;
        Ok(a.matmul(&b.t()?)?.affine(1.0 / self.tau, 0.0)?)
    }

    fn semi_grace(&self, h1: &Tensor, h2: &Tensor) -> Result<Tensor> {
        let refl = self.sim(h1, h1)?;
        let between = self.sim(h1, h2)?;
        let denom = (refl.exp()?.sum(1)? + between.exp()?.sum(1)?)?;
        let denom = (denom - diagonal(&refl)?.exp()?)?;
        Ok((denom.log()? - diagonal(&between)?)?)
    }

    /// GRACE loss: InfoNCE with both inter-view and intra-view negatives,
    /// averaged over the two directions.
    pub fn grace_loss(&self, z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
        let h1 = self.project(z1)?;
        let h2 = self.project(z2)?;
        let l1 = self.semi_grace(&h1, &h2)?;
        let l2 = self.semi_grace(&h2, &h1)?;
        Ok(((l1 + l2)? * 0.5)?)
    }

    /// Pushes each pair apart: `softplus(cos(h1_i, h2_i) / tau)`.
    pub fn push_loss(&self, z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
        let h1 = l2_normalize(&self.project(z1)?)?;
        let h2 = l2_normalize(&self.project(z2)?)?;
        let pos = (h1 * h2)?.sum(1)?.affine(1.0 / self.tau, 0.0)?;
        Ok(pos.exp()?.affine(1.0, 1.0)?.log()?)
    }

    /// Cross-view InfoNCE: the other view's rows are the only candidates.
    pub fn vanilla_loss(&self, z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
        let h1 = self.project(z1)?;
        let h2 = self.project(z2)?;
        let logits = self.sim(&h1, &h2)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok(diagonal(&log_probs)?.neg()?)
    }

    /// InfoNCE with exactly one negative per sample: the next row of the
    /// other view (wrapping around).
    pub fn vanilla_loss_with_one_negative(&self, z1: &Tensor, z2: &Tensor) -> Result<Tensor> {
        let b = z1.dim(0)?;
        let h1 = l2_normalize(&self.project(z1)?)?;
        let h2 = l2_normalize(&self.project(z2)?)?;
        let rolled: Vec<u32> = (0..b).map(|i| ((i + 1) % b) as u32).collect();
        let rolled = Tensor::from_vec(rolled, b, z1.device())?;
        let neg_view = h2.index_select(&rolled, 0)?;

        let pos = (&h1 * &h2)?.sum(1)?.affine(1.0 / self.tau, 0.0)?;
        let neg = (&h1 * &neg_view)?.sum(1)?.affine(1.0 / self.tau, 0.0)?;
        let logits = Tensor::stack(&[&pos, &neg], 1)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok(log_probs.narrow(1, 0, 1)?.squeeze(1)?.neg()?)
    }
}

/// Rows scaled to unit L2 norm; zero rows stay zero.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(NORM_EPS)?;
    Ok(x.broadcast_div(&norm)?)
}

/// Main diagonal of a square `(N, N)` matrix.
pub fn diagonal(m: &Tensor) -> Result<Tensor> {
    let n = m.dim(0)?;
    let eye = Tensor::eye(n, DType::F32, m.device())?.to_dtype(m.dtype())?;
    Ok((m * eye)?.sum(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn layer(h: usize, tau: f64) -> (VarMap, ContrastiveLayer) {
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &Device::Cpu);
        let l = ContrastiveLayer::new(h, tau, 0.5, vb).unwrap();
        (vm, l)
    }

    fn make_views(b: usize, h: usize) -> (Tensor, Tensor) {
        let a: Vec<f32> = (0..b * h).map(|i| (i as f32 * 0.37).sin()).collect();
        let c: Vec<f32> = (0..b * h).map(|i| (i as f32 * 0.37).sin() + 0.05 * (i as f32).cos()).collect();
        (
            Tensor::from_vec(a, (b, h), &Device::Cpu).unwrap(),
            Tensor::from_vec(c, (b, h), &Device::Cpu).unwrap(),
        )
    }

    #[test]
    fn test_losses_are_per_sample_and_finite() {
        let (_vm, cl) = layer(6, 0.5);
        let (a, b) = make_views(5, 6);
        for loss in [
            cl.grace_loss(&a, &b).unwrap(),
            cl.push_loss(&a, &b).unwrap(),
            cl.vanilla_loss(&a, &b).unwrap(),
            cl.vanilla_loss_with_one_negative(&a, &b).unwrap(),
        ] {
            assert_eq!(loss.dims(), &[5]);
            for v in loss.to_vec1::<f32>().unwrap() {
                assert!(v.is_finite() && v >= 0.0);
            }
        }
    }

    #[test]
    fn test_vanilla_lower_for_matching_views() {
        let (_vm, cl) = layer(6, 0.2);
        let (a, b) = make_views(4, 6);
        let matched = cl.vanilla_loss(&a, &a).unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        let shuffled_idx = Tensor::new(&[3u32, 2, 1, 0], &Device::Cpu).unwrap();
        let shuffled = b.index_select(&shuffled_idx, 0).unwrap();
        let mismatched = cl.vanilla_loss(&a, &shuffled).unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(matched < mismatched);
    }

    #[test]
    fn test_diagonal_and_normalize() {
        let m = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        assert_eq!(diagonal(&m).unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 4.0]);
        let z = Tensor::new(&[[3f32, 4.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let n = l2_normalize(&z).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(n, vec![vec![0.6, 0.8], vec![0.0, 0.0]]);
    }
}
