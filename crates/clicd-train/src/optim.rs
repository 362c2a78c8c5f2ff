//! Optimizers over candle `Var`s, gradient clipping and learning-rate annealing.
//!
//! All five learners share one state layout: an optional first and second
//! moment per variable. Weight decay is L2 (added to the gradient) for every
//! learner except sparse Adam, which ignores it. Moments are keyed by
//! variable name, so saved state restores into a freshly built model.
//!
//! | Learner     | first moment | second moment        |
//! |-------------|--------------|----------------------|
//! | SGD         | -            | -                    |
//! | Adagrad     | -            | sum of g²            |
//! | RMSprop     | -            | running mean of g²   |
//! | Adam        | running g    | running g²           |
//! | Sparse Adam | running g    | running g², touched rows only |

use crate::checkpoint::TensorRecord;
use crate::config::Learner;
use crate::{Error, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;
const ADAGRAD_EPS: f64 = 1e-10;
const RMSPROP_ALPHA: f64 = 0.99;
const RMSPROP_EPS: f64 = 1e-8;
const CLIP_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub learner: Learner,
    pub learning_rate: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    pub fn new(learner: Learner, learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            learner,
            learning_rate,
            weight_decay,
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    first: Option<Tensor>,
    second: Option<Tensor>,
}

/// One optimizer for any [`Learner`].
pub struct TrainOptimizer {
    config: OptimizerConfig,
    params: Vec<ParamState>,
    step: usize,
}

/// Moments of one named variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentRecord {
    pub name: String,
    pub first: Option<TensorRecord>,
    pub second: Option<TensorRecord>,
}

/// Serializable moments of a [`TrainOptimizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learner: Learner,
    pub learning_rate: f64,
    pub step: usize,
    pub moments: Vec<MomentRecord>,
}

impl OptimizerState {
    pub fn moment(&self, name: &str) -> Option<&MomentRecord> {
        self.moments.iter().find(|m| m.name == name)
    }
}

impl TrainOptimizer {
    /// An optimizer over named variables. Names key the exported state;
    /// non-float variables are skipped.
    pub fn from_named(vars: Vec<(String, Var)>, config: OptimizerConfig) -> Result<Self> {
        if config.learner == Learner::SparseAdam && config.weight_decay > 0.0 {
            warn!("sparse Adam ignores weight_decay={}", config.weight_decay);
        }
        let mut params = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            if !var.dtype().is_float() {
                continue;
            }
            if params.iter().any(|p: &ParamState| p.name == name) {
                return Err(Error::InvalidConfig(format!("variable `{name}` given to the optimizer twice")));
            }
            params.push(ParamState {
                name,
                var,
                first: None,
                second: None,
            });
        }
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learner(&self) -> Learner {
        self.config.learner
    }

    pub fn num_steps(&self) -> usize {
        self.step
    }

    pub fn vars(&self) -> Vec<Var> {
        self.params.iter().map(|p| p.var.clone()).collect()
    }

    pub fn export_state(&self) -> Result<OptimizerState> {
        let record = |t: &Option<Tensor>, name: String| -> Result<Option<TensorRecord>> {
            t.as_ref().map(|t| TensorRecord::from_tensor(name, t)).transpose()
        };
        let moments = self
            .params
            .iter()
            .map(|p| {
                Ok(MomentRecord {
                    name: p.name.clone(),
                    first: record(&p.first, format!("{}.m", p.name))?,
                    second: record(&p.second, format!("{}.v", p.name))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(OptimizerState {
            learner: self.config.learner,
            learning_rate: self.config.learning_rate,
            step: self.step,
            moments,
        })
    }

    /// Restore moments exported from an optimizer over the same variables.
    /// Entries are matched by name; a missing, extra or misshapen entry
    /// rejects the whole state and leaves this optimizer untouched.
    pub fn import_state(&mut self, state: OptimizerState, device: &Device) -> Result<()> {
        if state.learner != self.config.learner {
            return Err(Error::Checkpoint(format!(
                "optimizer state is for {}, current optimizer is {}",
                state.learner.as_str(),
                self.config.learner.as_str()
            )));
        }
        if state.moments.len() != self.params.len() {
            return Err(Error::Checkpoint(format!(
                "optimizer state has {} entries, expected {}",
                state.moments.len(),
                self.params.len()
            )));
        }
        let mut by_name: HashMap<String, MomentRecord> =
            state.moments.into_iter().map(|m| (m.name.clone(), m)).collect();
        let mut restored = Vec::with_capacity(self.params.len());
        for p in &self.params {
            let record = by_name
                .remove(&p.name)
                .ok_or_else(|| Error::Checkpoint(format!("optimizer state has no entry for `{}`", p.name)))?;
            let first = restore_moment(record.first, &p.var, device)?;
            let second = restore_moment(record.second, &p.var, device)?;
            restored.push((first, second));
        }
        if let Some(extra) = by_name.keys().next() {
            return Err(Error::Checkpoint(format!("optimizer state has unknown entry `{extra}`")));
        }
        for (p, (first, second)) in self.params.iter_mut().zip(restored) {
            p.first = first;
            p.second = second;
        }
        self.step = state.step;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }

    fn update(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step += 1;
        let OptimizerConfig {
            learner,
            learning_rate: lr,
            weight_decay,
        } = self.config;
        let t = self.step as i32;

        for p in &mut self.params {
            let Some(grad) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let theta = p.var.as_tensor().detach();
            let grad = if weight_decay != 0.0 && learner != Learner::SparseAdam {
                (grad + theta.affine(weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            let next = match learner {
                Learner::Sgd => (&theta - grad.affine(lr, 0.0)?)?,
                Learner::Adagrad => {
                    let sum = match &p.second {
                        Some(s) => (s + grad.sqr()?)?,
                        None => grad.sqr()?,
                    };
                    let step = grad.div(&sum.sqrt()?.affine(1.0, ADAGRAD_EPS)?)?.affine(lr, 0.0)?;
                    p.second = Some(sum.detach());
                    (&theta - step)?
                }
                Learner::RmsProp => {
                    let prev = match &p.second {
                        Some(s) => s.clone(),
                        None => grad.zeros_like()?,
                    };
                    let avg = (prev.affine(RMSPROP_ALPHA, 0.0)? + grad.sqr()?.affine(1.0 - RMSPROP_ALPHA, 0.0)?)?;
                    let step = grad.div(&avg.sqrt()?.affine(1.0, RMSPROP_EPS)?)?.affine(lr, 0.0)?;
                    p.second = Some(avg.detach());
                    (&theta - step)?
                }
                Learner::Adam => {
                    let (m, v) = moments(p, &grad, None)?;
                    let step = adam_step(&m, &v, lr, t)?;
                    p.first = Some(m);
                    p.second = Some(v);
                    (&theta - step)?
                }
                Learner::SparseAdam => {
                    let mask = touched_rows(&grad)?;
                    let (m, v) = moments(p, &grad, Some(&mask))?;
                    let step = adam_step(&m, &v, lr, t)?.broadcast_mul(&mask)?;
                    p.first = Some(m);
                    p.second = Some(v);
                    (&theta - step)?
                }
            };
            p.var.set(&next.detach())?;
        }
        Ok(())
    }
}

fn restore_moment(record: Option<TensorRecord>, var: &Var, device: &Device) -> Result<Option<Tensor>> {
    let Some(record) = record else {
        return Ok(None);
    };
    if record.shape.as_slice() != var.dims() {
        return Err(Error::Checkpoint(format!(
            "shape mismatch for `{}`: checkpoint {:?}, model {:?}",
            record.name,
            record.shape,
            var.dims()
        )));
    }
    Ok(Some(record.to_tensor(device)?.to_dtype(var.dtype())?))
}

/// Running first and second moments; with a row mask only masked rows move.
fn moments(p: &ParamState, grad: &Tensor, mask: Option<&Tensor>) -> candle_core::Result<(Tensor, Tensor)> {
    let m0 = match &p.first {
        Some(m) => m.clone(),
        None => grad.zeros_like()?,
    };
    let v0 = match &p.second {
        Some(v) => v.clone(),
        None => grad.zeros_like()?,
    };
    let dm = (grad - &m0)?.affine(1.0 - ADAM_BETA1, 0.0)?;
    let dv = (grad.sqr()? - &v0)?.affine(1.0 - ADAM_BETA2, 0.0)?;
    let (dm, dv) = match mask {
        Some(mask) => (dm.broadcast_mul(mask)?, dv.broadcast_mul(mask)?),
        None => (dm, dv),
    };
    Ok(((m0 + dm)?.detach(), (v0 + dv)?.detach()))
}

fn adam_step(m: &Tensor, v: &Tensor, lr: f64, t: i32) -> candle_core::Result<Tensor> {
    let bc1 = 1.0 - ADAM_BETA1.powi(t);
    let bc2 = 1.0 - ADAM_BETA2.powi(t);
    let m_hat = m.affine(1.0 / bc1, 0.0)?;
    let v_hat = v.affine(1.0 / bc2, 0.0)?;
    m_hat.div(&v_hat.sqrt()?.affine(1.0, ADAM_EPS)?)?.affine(lr, 0.0)
}

/// 1.0 for rows of `grad` with any non-zero entry, shaped to broadcast
/// against `grad`. Rank-0 and rank-1 gradients are masked elementwise.
fn touched_rows(grad: &Tensor) -> candle_core::Result<Tensor> {
    let dims = grad.dims().to_vec();
    let magnitude = if dims.len() < 2 {
        grad.abs()?
    } else {
        let mut keep = vec![1usize; dims.len()];
        keep[0] = dims[0];
        grad.abs()?.flatten_from(1)?.sum_keepdim(1)?.reshape(keep)?
    };
    magnitude.gt(&magnitude.zeros_like()?)?.to_dtype(grad.dtype())
}

impl Optimizer for TrainOptimizer {
    type Config = OptimizerConfig;

    /// Unnamed variables are keyed by position.
    fn new(vars: Vec<Var>, config: OptimizerConfig) -> candle_core::Result<Self> {
        let named = vars.into_iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect();
        Self::from_named(named, config).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.update(grads)
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }
}

/// Rescale the gradients of `vars` in place so their global `norm_type`-norm
/// is at most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64, norm_type: f64) -> Result<f64> {
    let mut present = Vec::new();
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            present.push((var.as_tensor().clone(), g.clone()));
        }
    }
    if present.is_empty() {
        return Ok(0.0);
    }

    let total = if norm_type.is_infinite() {
        present.iter().try_fold(0.0f64, |acc, (_, g)| -> Result<f64> {
            let m = g.abs()?.flatten_all()?.max(0)?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
            Ok(acc.max(m))
        })?
    } else {
        let sum = present.iter().try_fold(0.0f64, |acc, (_, g)| -> Result<f64> {
            let s = g
                .abs()?
                .powf(norm_type)?
                .sum_all()?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
            Ok(acc + s)
        })?;
        sum.powf(1.0 / norm_type)
    };

    let scale = max_norm / (total + CLIP_EPS);
    if scale < 1.0 {
        for (param, g) in present {
            grads.insert(&param, g.affine(scale, 0.0)?);
        }
    }
    Ok(total)
}

/// Cosine annealing from the optimizer's base rate down to `eta_min` over
/// `t_max` steps.
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f64,
    t_max: usize,
    eta_min: f64,
    t: usize,
}

impl CosineAnnealing {
    pub fn new(base_lr: f64, t_max: usize, eta_min: f64) -> Self {
        Self {
            base_lr,
            t_max: t_max.max(1),
            eta_min,
            t: 0,
        }
    }

    pub fn lr_at(&self, t: usize) -> f64 {
        let progress = std::f64::consts::PI * t as f64 / self.t_max as f64;
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + progress.cos()) / 2.0
    }

    /// Advance one step and apply the new rate to `opt`.
    pub fn step<O: Optimizer>(&mut self, opt: &mut O) -> f64 {
        self.t += 1;
        let lr = self.lr_at(self.t);
        opt.set_learning_rate(lr);
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn quadratic_descent(learner: Learner, lr: f64) -> f32 {
        let dev = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[3.0f32, -2.0], &dev).unwrap()).unwrap();
        let mut opt = TrainOptimizer::new(vec![w.clone()], OptimizerConfig::new(learner, lr, 0.0)).unwrap();
        for _ in 0..200 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        w.as_tensor().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_every_learner_descends() {
        for (learner, lr) in [
            (Learner::Sgd, 0.1),
            (Learner::Adagrad, 0.5),
            (Learner::RmsProp, 0.05),
            (Learner::Adam, 0.1),
            (Learner::SparseAdam, 0.1),
        ] {
            let end = quadratic_descent(learner, lr);
            assert!(end < 13.0 * 0.05, "{learner:?} ended at {end}");
        }
    }

    #[test]
    fn test_sparse_adam_leaves_untouched_rows() {
        let dev = Device::Cpu;
        let w = Var::from_tensor(&Tensor::ones((3, 2), DType::F32, &dev).unwrap()).unwrap();
        let mut opt = TrainOptimizer::new(vec![w.clone()], OptimizerConfig::new(Learner::SparseAdam, 0.1, 0.0)).unwrap();
        let rows = Tensor::new(&[0u32, 2], &dev).unwrap();
        let loss = w.as_tensor().index_select(&rows, 0).unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        let out = w.as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(out[1], vec![1.0, 1.0]);
        assert!(out[0][0] < 1.0 && out[2][1] < 1.0);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let dev = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[0.0f32, 0.0], &dev).unwrap()).unwrap();
        let target = Tensor::new(&[3.0f32, 4.0], &dev).unwrap();
        let loss = (w.as_tensor() * &target).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let norm = clip_grad_norm(&mut grads, &[w.clone()], 1.0, 2.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
        let g = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] - 0.6).abs() < 1e-4 && (g[1] - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_state_round_trip() {
        let dev = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[1.0f32, 2.0], &dev).unwrap()).unwrap();
        let mut opt = TrainOptimizer::new(vec![w.clone()], OptimizerConfig::new(Learner::Adam, 0.01, 0.0)).unwrap();
        opt.backward_step(&w.as_tensor().sum_all().unwrap()).unwrap();
        let state = opt.export_state().unwrap();
        assert_eq!(state.step, 1);

        let mut fresh = TrainOptimizer::new(vec![w.clone()], OptimizerConfig::new(Learner::Adam, 0.5, 0.0)).unwrap();
        fresh.import_state(state, &dev).unwrap();
        assert_eq!(fresh.num_steps(), 1);
        assert_eq!(fresh.learning_rate(), 0.01);

        let mut sgd = TrainOptimizer::new(vec![w], OptimizerConfig::new(Learner::Sgd, 0.5, 0.0)).unwrap();
        assert!(sgd.import_state(opt.export_state().unwrap(), &dev).is_err());
    }

    fn named_pair(dev: &Device) -> Vec<(String, Var)> {
        vec![
            ("bias".to_string(), Var::from_tensor(&Tensor::new(&[1.0f32, 2.0], dev).unwrap()).unwrap()),
            ("weight".to_string(), Var::ones((2, 2), DType::F32, dev).unwrap()),
        ]
    }

    #[test]
    fn test_state_restores_by_name() {
        let dev = Device::Cpu;
        let vars = named_pair(&dev);
        let config = OptimizerConfig::new(Learner::Adam, 0.01, 0.0);
        let mut opt = TrainOptimizer::from_named(vars.clone(), config).unwrap();
        let loss = (vars[0].1.as_tensor().sum_all().unwrap() + vars[1].1.as_tensor().sqr().unwrap().sum_all().unwrap())
            .unwrap();
        opt.backward_step(&loss).unwrap();
        let state = opt.export_state().unwrap();

        let mut reversed = vars.clone();
        reversed.reverse();
        let mut fresh = TrainOptimizer::from_named(reversed, config).unwrap();
        fresh.import_state(state.clone(), &dev).unwrap();
        let back = fresh.export_state().unwrap();
        for name in ["bias", "weight"] {
            assert_eq!(back.moment(name), state.moment(name));
        }
        assert_eq!(back.moment("weight").unwrap().first.as_ref().unwrap().shape, vec![2, 2]);
    }

    #[test]
    fn test_state_rejects_unknown_or_misshapen_entries() {
        let dev = Device::Cpu;
        let config = OptimizerConfig::new(Learner::Adam, 0.01, 0.0);
        let vars = named_pair(&dev);
        let mut opt = TrainOptimizer::from_named(vars.clone(), config).unwrap();
        opt.backward_step(&vars[1].1.as_tensor().sum_all().unwrap()).unwrap();
        let state = opt.export_state().unwrap();

        let renamed = vec![("bias".to_string(), vars[0].1.clone()), ("other".to_string(), vars[1].1.clone())];
        let mut fresh = TrainOptimizer::from_named(renamed, config).unwrap();
        let err = fresh.import_state(state.clone(), &dev).unwrap_err();
        assert!(err.to_string().contains("no entry for `other`"));
        assert_eq!(fresh.num_steps(), 0);

        let wrong = Var::ones(4, DType::F32, &dev).unwrap();
        let misshapen = vec![("bias".to_string(), vars[0].1.clone()), ("weight".to_string(), wrong)];
        let mut fresh = TrainOptimizer::from_named(misshapen, config).unwrap();
        let err = fresh.import_state(state, &dev).unwrap_err();
        assert!(err.to_string().contains("shape mismatch for `weight.m`"));
    }

    #[test]
    fn test_cosine_endpoints() {
        let sched = CosineAnnealing::new(1e-2, 10, 1e-4);
        assert!((sched.lr_at(0) - 1e-2).abs() < 1e-12);
        assert!((sched.lr_at(10) - 1e-4).abs() < 1e-12);
        assert!(sched.lr_at(5) < 1e-2 && sched.lr_at(5) > 1e-4);
    }
}
