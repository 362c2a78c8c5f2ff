//! Per-sample "mainstream agreement" weights and their distribution regularizer.
//!
//! The agreement of a sample measures how well its sequence representation
//! agrees with the graph neighborhood of its last item:
//!
//! ```text
//! a = sigmoid((cos(seq, aug) + cos(seq, foreign) + cos(civil, foreign)) / 3)
//! w = min_max(a) * (weight_mean / mean(min_max(a)))
//! ```
//!
//! Samples whose history has a single item carry no sequence signal and are
//! pinned to 0.5.

use crate::{Error, Result};
use candle_core::{DType, Tensor, D};
use rand::Rng;
use rand_distr::{Distribution, Normal};

pub const COSINE_EPS: f64 = 1e-12;
/// Weight given to samples with a length-1 history.
pub const NEUTRAL_WEIGHT: f64 = 0.5;
/// Spread of the Gaussian the sorted weights are pulled toward.
pub const TARGET_STD: f64 = 0.1;
const TARGET_FLOOR: f32 = 1e-6;
const RANGE_EPS: f32 = 1e-12;

/// Row-wise cosine similarity `a·b / max(|a||b|, eps)`, shape `(B,)`.
pub fn cosine_similarity(a: &Tensor, b: &Tensor, eps: f64) -> Result<Tensor> {
    let dot = (a * b)?.sum(D::Minus1)?;
    let na = a.sqr()?.sum(D::Minus1)?.sqrt()?;
    let nb = b.sqr()?.sum(D::Minus1)?.sqrt()?;
    Ok(dot.div(&(na * nb)?.maximum(eps)?)?)
}

/// Scale to `[0, 1]` across the batch. A batch with no spread maps to 0.5.
pub fn min_max_normalize(x: &Tensor) -> Result<Tensor> {
    let min = x.min_keepdim(0)?;
    let max = x.max_keepdim(0)?;
    let range = (&max - &min)?;
    let spread = range.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if spread.first().map_or(true, |&r| r < RANGE_EPS) {
        return Ok(x.ones_like()?.affine(NEUTRAL_WEIGHT, 0.0)?);
    }
    Ok(x.broadcast_sub(&min)?.broadcast_div(&range)?)
}

/// Rescale so the batch mean equals `target_mean`.
pub fn rescale_to_mean(x: &Tensor, target_mean: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(0)?;
    Ok(x.broadcast_div(&mean)?.affine(target_mean, 0.0)?)
}

/// Raw agreement before normalization: sigmoid of the mean of three cosines.
pub fn raw_agreement(seq: &Tensor, augmented: &Tensor, civil: &Tensor, foreign: &Tensor) -> Result<Tensor> {
    let v1 = cosine_similarity(seq, augmented, COSINE_EPS)?;
    let v2 = cosine_similarity(seq, foreign, COSINE_EPS)?;
    let v3 = cosine_similarity(civil, foreign, COSINE_EPS)?;
    let mean = ((v1 + v2)? + v3)?.affine(1.0 / 3.0, 0.0)?;
    Ok(candle_nn::ops::sigmoid(&mean)?)
}

/// Agreement weights for a batch: normalized, rescaled to `weight_mean`,
/// then pinned to [`NEUTRAL_WEIGHT`] wherever `seq_lens[i] == 1`.
pub fn subgraph_agreement(
    seq: &Tensor,
    augmented: &Tensor,
    civil: &Tensor,
    foreign: &Tensor,
    seq_lens: &[u32],
    weight_mean: f64,
) -> Result<Tensor> {
    let raw = raw_agreement(seq, augmented, civil, foreign)?;
    let weights = rescale_to_mean(&min_max_normalize(&raw)?, weight_mean)?;
    pin_short_sequences(&weights, seq_lens)
}

/// Replace weights of length-1 sequences with [`NEUTRAL_WEIGHT`].
pub fn pin_short_sequences(weights: &Tensor, seq_lens: &[u32]) -> Result<Tensor> {
    let n = weights.dim(0)?;
    if seq_lens.len() != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            got: seq_lens.len(),
        });
    }
    let short: Vec<f32> = seq_lens.iter().map(|&l| if l == 1 { 1.0 } else { 0.0 }).collect();
    let short = Tensor::from_vec(short, n, weights.device())?.to_dtype(weights.dtype())?;
    let keep = short.affine(-1.0, 1.0)?;
    Ok(((weights * keep)? + short.affine(NEUTRAL_WEIGHT, 0.0)?)?)
}

/// `max(w) - w`: emphasizes samples where graph and sequence disagree.
pub fn personalization_weights(weights: &Tensor) -> Result<Tensor> {
    Ok(weights.max_keepdim(0)?.broadcast_sub(weights)?)
}

/// `kl_weight * KL(target || softmax(w))` between the sorted log-softmax of
/// the weights and sorted draws from `N(weight_mean, 0.1)`, averaged over
/// the batch. Targets are floored at 1e-6 so the log stays finite.
pub fn kl_regularizer<R: Rng + ?Sized>(weights: &Tensor, weight_mean: f64, kl_weight: f64, rng: &mut R) -> Result<Tensor> {
    let n = weights.dim(0)?;
    let normal = Normal::new(weight_mean as f32, TARGET_STD as f32)
        .map_err(|e| Error::InvalidConfig(format!("target distribution: {e}")))?;
    let mut target: Vec<f32> = (0..n).map(|_| normal.sample(rng).max(TARGET_FLOOR)).collect();
    target.sort_by(f32::total_cmp);
    let target = Tensor::from_vec(target, n, weights.device())?.to_dtype(weights.dtype())?;

    let log_probs = candle_nn::ops::log_softmax(weights, 0)?.contiguous()?;
    let (sorted, _) = log_probs.sort_last_dim(true)?;
    let pointwise = (&target * (target.log()? - sorted)?)?;
    Ok(pointwise.sum_all()?.affine(kl_weight / n.max(1) as f64, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn t(v: &[f32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    fn rows(v: &[[f32; 2]]) -> Tensor {
        let flat: Vec<f32> = v.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (v.len(), 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        let a = rows(&[[1.0, 0.0], [0.0, 0.0]]);
        let b = rows(&[[2.0, 0.0], [1.0, 1.0]]);
        assert_eq!(cosine_similarity(&a, &b, COSINE_EPS).unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_min_max_and_rescale() {
        let x = t(&[0.2, 0.6, 1.0]);
        let n = min_max_normalize(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!((n[0]).abs() < 1e-6 && (n[1] - 0.5).abs() < 1e-6 && (n[2] - 1.0).abs() < 1e-6);
        let r = rescale_to_mean(&t(&n), 0.3).unwrap().to_vec1::<f32>().unwrap();
        assert!((r.iter().sum::<f32>() / 3.0 - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_constant_batch_is_neutral() {
        let n = min_max_normalize(&t(&[0.7, 0.7])).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(n, vec![0.5, 0.5]);
    }

    #[test]
    fn test_length_one_pinned() {
        let seq = rows(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let aug = rows(&[[1.0, 0.1], [1.0, 0.0], [0.5, 1.0]]);
        let civil = rows(&[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0]]);
        let foreign = rows(&[[1.0, 0.0], [0.0, 0.0], [1.0, 1.0]]);
        let w = subgraph_agreement(&seq, &aug, &civil, &foreign, &[1, 4, 1], 0.8).unwrap();
        let w = w.to_vec1::<f32>().unwrap();
        assert_eq!(w[0], 0.5);
        assert_eq!(w[2], 0.5);
    }

    #[test]
    fn test_personalization_nonnegative() {
        let p = personalization_weights(&t(&[0.1, 0.9, 0.4])).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(p.iter().copied().fold(f32::INFINITY, f32::min), 0.0);
        assert!((p[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_kl_finite() {
        let mut rng = StdRng::seed_from_u64(4);
        let kl = kl_regularizer(&t(&[0.2, 0.5, 0.9, 0.1]), 0.5, 1e-3, &mut rng).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap().is_finite());
    }
}
