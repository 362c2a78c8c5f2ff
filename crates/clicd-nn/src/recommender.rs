//! The capability contract between models and the trainers.

use crate::{Error, Result};
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use clicd_core::Interaction;

/// What a training phase optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Objective {
    Recommendation,
    KnowledgeGraph,
    Encoder,
    Decoder,
}

/// Which optimizer a phase steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerSlot {
    Primary,
    Secondary,
}

/// A primary loss plus named auxiliary terms.
///
/// The trainer backpropagates the sum and reports every component on its own.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub primary: Tensor,
    pub auxiliary: Vec<(String, Tensor)>,
}

impl LossOutput {
    pub fn new(primary: Tensor) -> Self {
        Self {
            primary,
            auxiliary: Vec::new(),
        }
    }

    pub fn with_auxiliary(mut self, name: impl Into<String>, loss: Tensor) -> Self {
        self.auxiliary.push((name.into(), loss));
        self
    }

    /// Sum of all components as a scalar tensor.
    pub fn total(&self) -> Result<Tensor> {
        let mut total = scalar(&self.primary)?;
        for (_, aux) in &self.auxiliary {
            total = (total + scalar(aux)?)?;
        }
        Ok(total)
    }

    /// Component names in reporting order, `"loss"` first.
    pub fn names(&self) -> Vec<String> {
        std::iter::once("loss".to_string())
            .chain(self.auxiliary.iter().map(|(n, _)| n.clone()))
            .collect()
    }

    /// Component values in the order of [`LossOutput::names`].
    pub fn values(&self) -> Result<Vec<f32>> {
        std::iter::once(&self.primary)
            .chain(self.auxiliary.iter().map(|(_, t)| t))
            .map(|t| Ok(scalar(t)?.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?))
            .collect()
    }
}

/// Fail with [`Error::NonFiniteLoss`] if any element of `loss` is NaN or infinite.
pub fn ensure_finite(loss: &Tensor, context: &str) -> Result<()> {
    let total = loss.to_dtype(candle_core::DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    if total.is_finite() {
        Ok(())
    } else {
        Err(Error::NonFiniteLoss {
            context: context.to_string(),
        })
    }
}

/// Every variable of `varmap` with its name, sorted by name.
///
/// `VarMap::all_vars` follows hash order, which differs between maps built
/// the same way; anything persisted per variable must use this order.
pub fn named_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = match varmap.data().lock() {
        Ok(data) => data,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut vars: Vec<(String, Var)> = data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

fn scalar(t: &Tensor) -> Result<Tensor> {
    Ok(if t.rank() == 0 { t.clone() } else { t.sum_all()? })
}

/// Handle naming one meta-adaptable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(&'static str);

impl ParamId {
    pub const ITEM_EMBEDDING: ParamId = ParamId("item_embedding");
    pub const POSITION_EMBEDDING: ParamId = ParamId("position_embedding");
    pub const TASK_LENGTH_EMBEDDING: ParamId = ParamId("task_length_embedding");

    pub fn name(self) -> &'static str {
        self.0
    }
}

/// The parameters a meta-learner may adapt, bound to tensors.
///
/// [`Recommender::meta_params`] returns the live parameters; the meta-trainer
/// derives adapted copies with [`MetaParams::with_values`] and passes them back
/// to [`Recommender::calculate_meta_loss`].
#[derive(Debug, Clone)]
pub struct MetaParams {
    entries: Vec<(ParamId, Tensor)>,
}

impl MetaParams {
    pub fn new(entries: Vec<(ParamId, Tensor)>) -> Self {
        Self { entries }
    }

    pub fn get(&self, id: ParamId) -> Result<&Tensor> {
        self.entries
            .iter()
            .find(|(p, _)| *p == id)
            .map(|(_, t)| t)
            .ok_or_else(|| Error::InvalidConfig(format!("meta parameter `{}` not bound", id.name())))
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.entries.iter().map(|(p, _)| *p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Tensor)> {
        self.entries.iter().map(|(p, t)| (*p, t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Same ids bound to new tensors, in the same order.
    pub fn with_values(&self, values: Vec<Tensor>) -> Result<Self> {
        if values.len() != self.entries.len() {
            return Err(Error::DimensionMismatch {
                expected: self.entries.len(),
                got: values.len(),
            });
        }
        Ok(Self {
            entries: self.ids().zip(values).collect(),
        })
    }
}

/// A trainable recommender.
///
/// Only `name`, `calculate_loss`, `predict`, `varmap` and `set_training` are
/// required; every other capability has a default that either opts out or
/// reports [`Error::Unsupported`].
pub trait Recommender {
    fn name(&self) -> &str;

    fn calculate_loss(&mut self, objective: Objective, batch: &Interaction) -> Result<LossOutput>;

    /// Score the `item_id` of every row, `(B,)`.
    fn predict(&mut self, batch: &Interaction) -> Result<Tensor>;

    /// Score every item for every row, `(B, n_items)`. `None` when the model
    /// cannot rank the whole catalog at once.
    fn full_sort_predict(&mut self, _batch: &Interaction) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// Score the `item_id_with_negs` candidates of every row, `(B, C)`.
    fn fast_predict(&mut self, _batch: &Interaction) -> Result<Option<Tensor>> {
        Ok(None)
    }

    /// [`Recommender::fast_predict`] plus a per-row conformity weight `(B,)`.
    fn fast_predict_with_conformity(&mut self, _batch: &Interaction) -> Result<Option<(Tensor, Tensor)>> {
        Ok(None)
    }

    fn varmap(&self) -> &VarMap;

    /// Named variables stepped by the optimizer in `slot`, sorted by name.
    /// Everything goes to the primary optimizer unless a model splits its
    /// parameters.
    fn parameter_groups(&self, slot: OptimizerSlot) -> Vec<(String, Var)> {
        match slot {
            OptimizerSlot::Primary => named_vars(self.varmap()),
            OptimizerSlot::Secondary => Vec::new(),
        }
    }

    fn meta_params(&self) -> Result<MetaParams> {
        Err(Error::Unsupported("meta learning"))
    }

    /// Loss of predicting each chunk's last item, computed with `params` in
    /// place of the live meta-adaptable parameters.
    fn calculate_meta_loss(&mut self, _chunks: &Tensor, _task_label: usize, _params: &MetaParams) -> Result<Tensor> {
        Err(Error::Unsupported("meta learning"))
    }

    /// Non-parameter state that belongs in checkpoints.
    fn other_parameter(&self) -> Vec<(String, Tensor)> {
        Vec::new()
    }

    fn load_other_parameter(&mut self, _state: Vec<(String, Tensor)>) -> Result<()> {
        Ok(())
    }

    /// Hook run after a schedule phase finishes.
    fn on_phase_end(&mut self, _objective: Objective) -> Result<()> {
        Ok(())
    }

    fn set_training(&mut self, train: bool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_total_and_components() {
        let dev = Device::Cpu;
        let out = LossOutput::new(Tensor::new(1.5f32, &dev).unwrap())
            .with_auxiliary("cl", Tensor::new(&[0.25f32], &dev).unwrap())
            .with_auxiliary("kl", Tensor::new(0.25f32, &dev).unwrap());
        assert_eq!(out.total().unwrap().to_scalar::<f32>().unwrap(), 2.0);
        assert_eq!(out.names(), vec!["loss", "cl", "kl"]);
        assert_eq!(out.values().unwrap(), vec![1.5, 0.25, 0.25]);
    }

    #[test]
    fn test_meta_params_rebind() {
        let dev = Device::Cpu;
        let params = MetaParams::new(vec![
            (ParamId::ITEM_EMBEDDING, Tensor::zeros((2, 2), candle_core::DType::F32, &dev).unwrap()),
            (ParamId::POSITION_EMBEDDING, Tensor::zeros((3, 2), candle_core::DType::F32, &dev).unwrap()),
        ]);
        assert!(params.get(ParamId::TASK_LENGTH_EMBEDDING).is_err());
        let ones = params
            .iter()
            .map(|(_, t)| t.ones_like().unwrap())
            .collect::<Vec<_>>();
        let rebound = params.with_values(ones).unwrap();
        assert_eq!(rebound.get(ParamId::POSITION_EMBEDDING).unwrap().dims(), &[3, 2]);
        assert!(params.with_values(Vec::new()).is_err());
    }

    #[test]
    fn test_named_vars_sorted() {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &Device::Cpu);
        for name in ["zeta", "alpha", "mid"] {
            vb.get_with_hints(2, name, candle_nn::Init::Const(0.0)).unwrap();
        }
        let names: Vec<String> = named_vars(&varmap).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_ensure_finite() {
        let dev = Device::Cpu;
        assert!(ensure_finite(&Tensor::new(&[1f32, 2.0], &dev).unwrap(), "ok").is_ok());
        let nan = Tensor::new(f32::NAN, &dev).unwrap();
        assert!(matches!(ensure_finite(&nan, "x"), Err(Error::NonFiniteLoss { .. })));
    }
}
