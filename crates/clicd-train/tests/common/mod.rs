//! Shared fixtures for the trainer integration tests.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use clicd_core::interaction::{ITEM_ID, ITEM_SEQ, ITEM_SEQ_LEN, USER_ID};
use clicd_core::Interaction;
use clicd_nn::{LossOutput, Objective, Recommender};

/// Mean-of-history dot product scorer.
pub struct Toy {
    varmap: VarMap,
    items: Tensor,
    bias: Tensor,
    training: bool,
    fail_scoring: bool,
}

impl Toy {
    pub fn new(n_items: usize, hidden: usize) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let items = vb
            .get_with_hints((n_items, hidden), "items", Init::Randn { mean: 0.0, stdev: 1.0 })
            .unwrap();
        let bias = vb.get_with_hints(n_items, "bias", Init::Const(0.0)).unwrap();
        Self {
            varmap,
            items,
            bias,
            training: true,
            fail_scoring: false,
        }
    }

    /// A model whose scoring always errors.
    pub fn failing(n_items: usize, hidden: usize) -> Self {
        Self {
            fail_scoring: true,
            ..Self::new(n_items, hidden)
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn user_repr(&self, batch: &Interaction) -> clicd_nn::Result<Tensor> {
        let seq = batch.get(ITEM_SEQ)?;
        let (b, l) = seq.dims2()?;
        let h = self.items.dim(1)?;
        let emb = self.items.index_select(&seq.flatten_all()?, 0)?;
        Ok(emb.reshape((b, l, h))?.mean(1)?)
    }
}

impl Recommender for Toy {
    fn name(&self) -> &str {
        "Toy"
    }

    fn calculate_loss(&mut self, _objective: Objective, batch: &Interaction) -> clicd_nn::Result<LossOutput> {
        let logits = self.user_repr(batch)?.matmul(&self.items.t()?)?.broadcast_add(&self.bias)?;
        let target = batch.get(ITEM_ID)?;
        Ok(LossOutput::new(candle_nn::loss::cross_entropy(&logits, target)?))
    }

    fn predict(&mut self, batch: &Interaction) -> clicd_nn::Result<Tensor> {
        if self.fail_scoring {
            return Err(clicd_nn::Error::InvalidConfig("scoring disabled".into()));
        }
        let target = self.items.index_select(batch.get(ITEM_ID)?, 0)?;
        let bias = self.bias.index_select(batch.get(ITEM_ID)?, 0)?;
        Ok(((self.user_repr(batch)? * target)?.sum(1)? + bias)?)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn set_training(&mut self, train: bool) {
        self.training = train;
    }
}

pub fn batch(rows: &[(Vec<u32>, u32)], width: usize) -> Interaction {
    let dev = Device::Cpu;
    let b = rows.len();
    let mut seq = vec![0u32; b * width];
    for (r, (hist, _)) in rows.iter().enumerate() {
        for (c, &i) in hist.iter().take(width).enumerate() {
            seq[r * width + c] = i;
        }
    }
    let lens: Vec<u32> = rows.iter().map(|(h, _)| h.len().min(width) as u32).collect();
    Interaction::from_fields([
        (USER_ID, Tensor::from_vec((0..b as u32).collect::<Vec<_>>(), b, &dev).unwrap()),
        (ITEM_SEQ, Tensor::from_vec(seq, (b, width), &dev).unwrap()),
        (ITEM_SEQ_LEN, Tensor::from_vec(lens, b, &dev).unwrap()),
        (ITEM_ID, Tensor::from_vec(rows.iter().map(|(_, t)| *t).collect::<Vec<_>>(), b, &dev).unwrap()),
    ])
    .unwrap()
}
