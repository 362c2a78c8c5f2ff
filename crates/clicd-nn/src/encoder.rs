//! Bidirectional transformer encoder used for sequence representations.
//!
//! Post-norm layers (attention, then position-wise feed-forward), each with
//! a residual connection and LayerNorm, following BERT4Rec.

use crate::config::{ClicdConfig, HiddenAct};
use crate::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{layer_norm, Dropout, Init, LayerNorm, Linear, Module, VarBuilder};

/// Additive mask value for padded key positions.
const MASK_VALUE: f32 = -10_000.0;

/// Linear layer with `N(0, std)` weights and zero bias.
pub(crate) fn normal_linear(in_dim: usize, out_dim: usize, std: f64, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Randn { mean: 0.0, stdev: std })?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

pub(crate) fn activate(x: &Tensor, act: HiddenAct) -> Result<Tensor> {
    Ok(match act {
        HiddenAct::Gelu => x.gelu_erf()?,
        HiddenAct::Relu => x.relu()?,
        HiddenAct::Swish => candle_nn::ops::silu(x)?,
        HiddenAct::Tanh => x.tanh()?,
        HiddenAct::Sigmoid => candle_nn::ops::sigmoid(x)?,
    })
}

/// Additive attention mask `(B, 1, 1, L)`: 0 where the key is a real item,
/// -10000 where it is padding.
pub fn bidirectional_mask(item_seq: &Tensor, device: &Device) -> Result<Tensor> {
    let (b, l) = item_seq.dims2()?;
    let mask: Vec<f32> = item_seq
        .to_dtype(DType::U32)?
        .flatten_all()?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|id| if id > 0 { 0.0 } else { MASK_VALUE })
        .collect();
    Ok(Tensor::from_vec(mask, (b, 1, 1, l), device)?)
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dense: Linear,
    norm: LayerNorm,
    attn_dropout: Dropout,
    out_dropout: Dropout,
    n_heads: usize,
    head_size: usize,
}

impl SelfAttention {
    fn new(cfg: &ClicdConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let std = cfg.initializer_range;
        Ok(Self {
            query: normal_linear(h, h, std, vb.pp("query"))?,
            key: normal_linear(h, h, std, vb.pp("key"))?,
            value: normal_linear(h, h, std, vb.pp("value"))?,
            dense: normal_linear(h, h, std, vb.pp("dense"))?,
            norm: layer_norm(h, cfg.layer_norm_eps, vb.pp("norm"))?,
            attn_dropout: Dropout::new(cfg.attn_dropout_prob),
            out_dropout: Dropout::new(cfg.hidden_dropout_prob),
            n_heads: cfg.n_heads,
            head_size: h / cfg.n_heads,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, l, _) = x.dims3()?;
        Ok(x.reshape((b, l, self.n_heads, self.head_size))?.transpose(1, 2)?.contiguous()?)
    }

    fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (b, l, h) = x.dims3()?;
        let q = self.split_heads(&self.query.forward(x)?)?;
        let k = self.split_heads(&self.key.forward(x)?)?;
        let v = self.split_heads(&self.value.forward(x)?)?;

        let scale = 1.0 / (self.head_size as f64).sqrt();
        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?.affine(scale, 0.0)?;
        let scores = scores.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let probs = self.attn_dropout.forward(&probs, train)?;

        let context = probs.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((b, l, h))?;
        let out = self.out_dropout.forward(&self.dense.forward(&context)?, train)?;
        Ok(self.norm.forward(&(out + x)?)?)
    }
}

struct FeedForward {
    dense_1: Linear,
    dense_2: Linear,
    norm: LayerNorm,
    dropout: Dropout,
    act: HiddenAct,
}

impl FeedForward {
    fn new(cfg: &ClicdConfig, vb: VarBuilder) -> Result<Self> {
        let std = cfg.initializer_range;
        Ok(Self {
            dense_1: normal_linear(cfg.hidden_size, cfg.inner_size, std, vb.pp("dense_1"))?,
            dense_2: normal_linear(cfg.inner_size, cfg.hidden_size, std, vb.pp("dense_2"))?,
            norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("norm"))?,
            dropout: Dropout::new(cfg.hidden_dropout_prob),
            act: cfg.hidden_act,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = activate(&self.dense_1.forward(x)?, self.act)?;
        let h = self.dropout.forward(&self.dense_2.forward(&h)?, train)?;
        Ok(self.norm.forward(&(h + x)?)?)
    }
}

/// Stack of `n_layers` transformer layers.
pub struct TransformerEncoder {
    layers: Vec<(SelfAttention, FeedForward)>,
}

impl TransformerEncoder {
    pub fn new(cfg: &ClicdConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.n_layers)
            .map(|i| {
                let vb = vb.pp(format!("layer.{i}"));
                Ok((SelfAttention::new(cfg, vb.pp("attention"))?, FeedForward::new(cfg, vb.pp("ffn"))?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Output of every layer, first to last (`(B, L, H)` each).
    pub fn forward_all(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let mut outputs = Vec::with_capacity(self.layers.len());
        let mut hidden = x.clone();
        for (attn, ffn) in &self.layers {
            hidden = ffn.forward(&attn.forward(&hidden, mask, train)?, train)?;
            outputs.push(hidden.clone());
        }
        Ok(outputs)
    }

    /// Output of the last layer; the input itself when there are no layers.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.forward_all(x, mask, train)?.pop().unwrap_or_else(|| x.clone()))
    }
}

/// Row-wise gather of position `index[b]` from `(B, L, H)`, giving `(B, H)`.
pub fn gather_positions(output: &Tensor, positions: &[usize]) -> Result<Tensor> {
    let (b, l, h) = output.dims3()?;
    let flat: Vec<u32> = positions
        .iter()
        .enumerate()
        .map(|(row, &p)| (row * l + p.min(l.saturating_sub(1))) as u32)
        .collect();
    let index = Tensor::from_vec(flat, b, output.device())?;
    Ok(output.reshape((b * l, h))?.index_select(&index, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn encoder(cfg: &ClicdConfig) -> (VarMap, TransformerEncoder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let enc = TransformerEncoder::new(cfg, vb).unwrap();
        (varmap, enc)
    }

    #[test]
    fn test_output_shapes() {
        let cfg = ClicdConfig::default().with_hidden_size(8).with_layers(2, 2).with_inner_size(16);
        let (_vm, enc) = encoder(&cfg);
        let x = Tensor::randn(0f32, 1f32, (3, 5, 8), &Device::Cpu).unwrap();
        let seq = Tensor::new(&[[1u32, 2, 0, 0, 0], [3, 4, 5, 6, 7], [1, 0, 0, 0, 0]], &Device::Cpu).unwrap();
        let mask = bidirectional_mask(&seq, &Device::Cpu).unwrap();
        let all = enc.forward_all(&x, &mask, false).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].dims(), &[3, 5, 8]);
    }

    #[test]
    fn test_padding_keys_do_not_leak() {
        let cfg = ClicdConfig::default().with_hidden_size(4).with_layers(1, 1).with_inner_size(8);
        let (_vm, enc) = encoder(&cfg);
        let seq = Tensor::new(&[[1u32, 2, 0]], &Device::Cpu).unwrap();
        let mask = bidirectional_mask(&seq, &Device::Cpu).unwrap();
        let base = Tensor::randn(0f32, 1f32, (1, 3, 4), &Device::Cpu).unwrap();
        // Change only the padded position's input.
        let bumped = base.slice_assign(&[0..1, 2..3, 0..4], &Tensor::ones((1, 1, 4), DType::F32, &Device::Cpu).unwrap()).unwrap();
        let a = enc.forward(&base, &mask, false).unwrap().narrow(1, 0, 2).unwrap();
        let b = enc.forward(&bumped, &mask, false).unwrap().narrow(1, 0, 2).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-3);
    }

    #[test]
    fn test_gather_positions() {
        let out = Tensor::arange(0f32, 12.0, &Device::Cpu).unwrap().reshape((2, 3, 2)).unwrap();
        let g = gather_positions(&out, &[2, 0]).unwrap();
        assert_eq!(g.to_vec2::<f32>().unwrap(), vec![vec![4.0, 5.0], vec![6.0, 7.0]]);
    }
}
