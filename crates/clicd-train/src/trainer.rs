//! The epoch loop: train, validate every `eval_step` epochs, keep the best
//! checkpoint, stop early.
//!
//! ```text
//! start_epoch -> { train phases -> [validate] -> [checkpoint] }* -> stop
//! ```
//!
//! What runs inside an epoch comes from an [`EpochSchedule`]. A trainer can
//! also carry an [`AuxiliaryLoss`] that adds one extra term to every batch.

use crate::checkpoint::{load_state_dict, state_dict, Checkpoint, TensorRecord};
use crate::config::{Learner, TrainerConfig};
use crate::early_stopping::{early_stopping, initial_best};
use crate::evaluation::{eval_batch, EvalResult, RankingEvaluator};
use crate::optim::{clip_grad_norm, OptimizerConfig, OptimizerState, TrainOptimizer};
use crate::schedule::{EpochSchedule, Phase, Standard};
use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Optimizer;
use clicd_core::{EvalLoader, Interaction, SequenceLoader};
use clicd_nn::{OptimizerSlot, Recommender};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// An extra loss term added to every training batch.
pub trait AuxiliaryLoss<M: ?Sized> {
    /// Name reported next to the model's own components.
    fn name(&self) -> &str;

    /// `None` when this batch yields no extra term.
    fn batch_loss(&mut self, model: &mut M, batch: &Interaction, epoch: usize) -> Result<Option<Tensor>>;
}

/// Per-component loss sums over one epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochLoss {
    pub components: Vec<(String, f64)>,
}

impl EpochLoss {
    fn add(&mut self, names: &[String], values: &[f32]) {
        for (name, &v) in names.iter().zip(values) {
            match self.components.iter_mut().find(|(n, _)| n == name) {
                Some((_, sum)) => *sum += f64::from(v),
                None => self.components.push((name.clone(), f64::from(v))),
            }
        }
    }

    fn merge(&mut self, other: &EpochLoss) {
        for (name, v) in &other.components {
            self.add(std::slice::from_ref(name), &[*v as f32]);
        }
    }

    pub fn total(&self) -> f64 {
        self.components.iter().map(|(_, v)| v).sum()
    }

    pub fn summary(&self) -> String {
        match self.components.as_slice() {
            [(_, v)] => format!("train loss: {v:.4}"),
            parts => parts
                .iter()
                .map(|(n, v)| format!("train_{n}: {v:.4}"))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// What one finished epoch reports to progress callbacks.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub loss: EpochLoss,
    pub valid_score: Option<f64>,
    pub saved: bool,
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub best_valid_score: f64,
    pub best_valid_result: Option<EvalResult>,
    pub epochs_run: usize,
}

pub struct Trainer<M: Recommender> {
    config: TrainerConfig,
    model: M,
    schedule: Box<dyn EpochSchedule>,
    primary: TrainOptimizer,
    secondary: Option<TrainOptimizer>,
    auxiliary: Option<Box<dyn AuxiliaryLoss<M>>>,
    start_epoch: usize,
    cur_step: usize,
    best_valid_score: f64,
    best_valid_result: Option<EvalResult>,
}

impl<M: Recommender> Trainer<M> {
    pub fn new(config: TrainerConfig, model: M) -> Result<Self> {
        Self::with_schedule(config, model, Box::new(Standard))
    }

    /// A trainer for models fitted in one pass.
    pub fn traditional(config: TrainerConfig, model: M) -> Result<Self> {
        Self::new(config.with_epochs(1).with_eval_step(1), model)
    }

    pub fn with_schedule(config: TrainerConfig, model: M, schedule: Box<dyn EpochSchedule>) -> Result<Self> {
        config.validate()?;
        let learner = Learner::parse_or_default(&config.learner);
        if config.reg_weight.unwrap_or(0.0) * config.weight_decay > 0.0 {
            warn!(
                "weight_decay and reg_weight are both set; parameters will be regularized twice"
            );
        }
        let opt_config = OptimizerConfig::new(learner, config.learning_rate, config.weight_decay);
        let primary = TrainOptimizer::from_named(model.parameter_groups(OptimizerSlot::Primary), opt_config)?;
        let secondary = if schedule.needs_secondary() {
            Some(TrainOptimizer::from_named(
                model.parameter_groups(OptimizerSlot::Secondary),
                opt_config,
            )?)
        } else {
            None
        };
        info!(
            model = model.name(),
            learner = learner.as_str(),
            schedule = schedule.name(),
            "trainer ready"
        );
        Ok(Self {
            best_valid_score: initial_best(config.valid_metric_bigger),
            config,
            model,
            schedule,
            primary,
            secondary,
            auxiliary: None,
            start_epoch: 0,
            cur_step: 0,
            best_valid_result: None,
        })
    }

    pub fn set_auxiliary_loss(&mut self, aux: Box<dyn AuxiliaryLoss<M>>) {
        self.auxiliary = Some(aux);
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Moments of the primary optimizer, as a checkpoint would store them.
    pub fn optimizer_state(&self) -> Result<OptimizerState> {
        self.primary.export_state()
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn cur_step(&self) -> usize {
        self.cur_step
    }

    pub fn best_valid_score(&self) -> f64 {
        self.best_valid_score
    }

    pub fn saved_model_file(&self) -> PathBuf {
        self.config.saved_model_file()
    }

    // =========================================================================
    // Training
    // =========================================================================

    /// One pass over `batches` with the phase's objective and optimizer.
    pub fn train_epoch(&mut self, epoch: usize, phase: Phase, batches: &[Interaction]) -> Result<EpochLoss> {
        self.model.set_training(true);
        let mut sums = EpochLoss::default();
        for (batch_idx, batch) in batches.iter().enumerate() {
            let out = self.model.calculate_loss(phase.objective, batch)?;
            let mut total = out.total()?;
            let mut names = out.names();
            let mut values = out.values()?;

            if let Some(aux) = self.auxiliary.as_mut() {
                if let Some(extra) = aux.batch_loss(&mut self.model, batch, epoch)? {
                    let extra = if extra.rank() == 0 { extra } else { extra.sum_all()? };
                    values.push(extra.to_dtype(DType::F32)?.to_scalar::<f32>()?);
                    names.push(aux.name().to_string());
                    total = (total + extra)?;
                }
            }

            let value = total.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            if !value.is_finite() {
                return Err(Error::NonFiniteLoss { epoch, batch: batch_idx });
            }
            sums.add(&names, &values);

            let optimizer = match phase.slot {
                OptimizerSlot::Primary => &mut self.primary,
                OptimizerSlot::Secondary => self
                    .secondary
                    .as_mut()
                    .ok_or_else(|| Error::InvalidConfig("schedule asked for a secondary optimizer".into()))?,
            };
            let mut grads = total.backward()?;
            if let Some(clip) = self.config.clip_grad_norm {
                let norm = clip_grad_norm(&mut grads, &optimizer.vars(), clip.max_norm, clip.norm_type)?;
                debug!(batch = batch_idx, grad_norm = norm, "clipped gradients");
            }
            optimizer.step(&grads)?;
        }
        Ok(sums)
    }

    /// Every phase the schedule lists for `epoch`, in order.
    fn run_phases(&mut self, epoch: usize, batches: &[Interaction]) -> Result<EpochLoss> {
        let mut loss = EpochLoss::default();
        for phase in self.schedule.phases(epoch) {
            let part = self.train_epoch(epoch, phase, batches)?;
            if phase.notify {
                self.model.on_phase_end(phase.objective)?;
            }
            loss.merge(&part);
        }
        Ok(loss)
    }

    pub fn fit(&mut self, train: &mut SequenceLoader, valid: Option<&EvalLoader>) -> Result<FitOutcome> {
        self.fit_with_progress(train, valid, |_| {})
    }

    /// [`Trainer::fit`], calling `on_epoch` after every epoch.
    pub fn fit_with_progress<F: FnMut(&EpochReport)>(
        &mut self,
        train: &mut SequenceLoader,
        valid: Option<&EvalLoader>,
        mut on_epoch: F,
    ) -> Result<FitOutcome> {
        let eval_step = self.config.eval_step.min(self.config.epochs);
        let valid = valid.filter(|v| !v.is_empty() && eval_step > 0);
        let mut epochs_run = 0;

        for epoch in self.start_epoch..self.config.epochs {
            let started = Instant::now();
            let batches = train.batches()?;
            let loss = self.run_phases(epoch, &batches)?;
            epochs_run += 1;
            info!(
                "epoch {epoch} training [time: {:.2}s, {}]",
                started.elapsed().as_secs_f64(),
                loss.summary()
            );

            let Some(valid) = valid else {
                self.save_checkpoint(epoch)?;
                on_epoch(&EpochReport {
                    epoch,
                    loss,
                    valid_score: None,
                    saved: true,
                });
                continue;
            };
            if (epoch + 1) % eval_step != 0 {
                on_epoch(&EpochReport {
                    epoch,
                    loss,
                    valid_score: None,
                    saved: false,
                });
                continue;
            }

            let started = Instant::now();
            let result = self.evaluate(valid)?;
            let score = result.get(&self.config.valid_metric).ok_or_else(|| {
                Error::InvalidConfig(format!("valid_metric `{}` was not computed", self.config.valid_metric))
            })?;
            let decision = early_stopping(
                score,
                self.best_valid_score,
                self.cur_step,
                self.config.stopping_step,
                self.config.valid_metric_bigger,
            );
            self.best_valid_score = decision.best;
            self.cur_step = decision.cur_step;
            info!(
                "epoch {epoch} evaluating [time: {:.2}s, valid_score: {score:.6}]",
                started.elapsed().as_secs_f64()
            );
            info!("valid result: {}", result.summary());

            if decision.update {
                self.save_checkpoint(epoch)?;
                self.best_valid_result = Some(result);
            }
            on_epoch(&EpochReport {
                epoch,
                loss,
                valid_score: Some(score),
                saved: decision.update,
            });
            if decision.stop {
                let best_epoch = epoch.saturating_sub(self.cur_step * eval_step);
                info!("Finished training, best eval result in epoch {best_epoch}");
                break;
            }
        }

        Ok(FitOutcome {
            best_valid_score: self.best_valid_score,
            best_valid_result: self.best_valid_result.clone(),
            epochs_run,
        })
    }

    /// Train without validation, snapshotting every `save_step` epochs and
    /// after the last one.
    pub fn pretrain(&mut self, train: &mut SequenceLoader) -> Result<Vec<PathBuf>> {
        let mut saved = Vec::new();
        let save_step = self.config.save_step.max(1);
        for epoch in self.start_epoch..self.config.epochs {
            let batches = train.batches()?;
            let loss = self.run_phases(epoch, &batches)?;
            info!("epoch {epoch} pretraining [{}]", loss.summary());
            if (epoch + 1) % save_step == 0 || epoch + 1 == self.config.epochs {
                let path = self.config.pretrain_file(epoch + 1);
                self.checkpoint(epoch)?.save(&path)?;
                info!("Saving current: {}", path.display());
                saved.push(path);
            }
        }
        Ok(saved)
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Score every batch of `loader` and reduce to metrics. The model is back
    /// in training mode afterwards, whether or not scoring succeeded.
    pub fn evaluate(&mut self, loader: &EvalLoader) -> Result<EvalResult> {
        self.model.set_training(false);
        let result = self.score_loader(loader);
        self.model.set_training(true);
        result
    }

    fn score_loader(&mut self, loader: &EvalLoader) -> Result<EvalResult> {
        let mut collector = RankingEvaluator::new(&self.config.topk);
        for batch in loader.batches()? {
            let scored = eval_batch(
                &mut self.model,
                loader.kind(),
                &batch,
                loader.num_items(),
                self.config.eval_batch_size,
                self.config.eval_type,
            )?;
            collector.collect(&scored)?;
        }
        Ok(collector.evaluate())
    }

    /// Load `checkpoint` (or the best saved model) and evaluate.
    pub fn evaluate_checkpoint(&mut self, loader: &EvalLoader, checkpoint: Option<&Path>) -> Result<EvalResult> {
        let path = checkpoint.map_or_else(|| self.config.saved_model_file(), Path::to_path_buf);
        let ckpt = Checkpoint::load(&path)?;
        self.load_model_state(&ckpt)?;
        info!("Loading model structure and parameters from {}", path.display());
        self.evaluate(loader)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    fn checkpoint(&self, epoch: usize) -> Result<Checkpoint> {
        let other = self
            .model
            .other_parameter()
            .iter()
            .map(|(name, t)| TensorRecord::from_tensor(name.clone(), t))
            .collect::<Result<Vec<_>>>()?;
        Ok(Checkpoint {
            config_json: serde_json::to_string(&self.config)?,
            model_name: self.model.name().to_string(),
            epoch: epoch as i64,
            cur_step: self.cur_step,
            best_valid_score: self.best_valid_score,
            state_dict: state_dict(self.model.varmap())?,
            other_parameter: other,
            optimizer: Some(self.primary.export_state()?),
            secondary_optimizer: self.secondary.as_ref().map(TrainOptimizer::export_state).transpose()?,
        })
    }

    /// Write the current state to the saved-model path.
    pub fn save_checkpoint(&self, epoch: usize) -> Result<PathBuf> {
        let path = self.config.saved_model_file();
        self.checkpoint(epoch)?.save(&path)?;
        info!("Saving current: {}", path.display());
        Ok(path)
    }

    /// Restore model, optimizer and early-stopping state; training resumes
    /// at the epoch after the saved one.
    pub fn resume_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let ckpt = Checkpoint::load(path)?;
        if !ckpt.model_name.eq_ignore_ascii_case(&self.config.model_name) {
            warn!(
                "Architecture configuration given in config file is different from that of checkpoint ({} vs {}). \
                 This may yield an exception while state_dict is being loaded.",
                self.config.model_name, ckpt.model_name
            );
        }
        self.load_model_state(&ckpt)?;
        let device = self.device();
        if let Some(state) = ckpt.optimizer {
            self.primary.import_state(state, &device)?;
        }
        if let (Some(opt), Some(state)) = (self.secondary.as_mut(), ckpt.secondary_optimizer) {
            opt.import_state(state, &device)?;
        }
        self.start_epoch = usize::try_from(ckpt.epoch + 1).unwrap_or(0);
        self.cur_step = ckpt.cur_step;
        self.best_valid_score = ckpt.best_valid_score;
        info!("Checkpoint loaded. Resume training from epoch {}", self.start_epoch);
        Ok(())
    }

    fn load_model_state(&mut self, ckpt: &Checkpoint) -> Result<()> {
        load_state_dict(self.model.varmap(), &ckpt.state_dict)?;
        let device = self.device();
        let other = ckpt
            .other_parameter
            .iter()
            .map(|r| Ok((r.name.clone(), r.to_tensor(&device)?)))
            .collect::<Result<Vec<_>>>()?;
        self.model.load_other_parameter(other)?;
        Ok(())
    }

    fn device(&self) -> Device {
        self.model
            .varmap()
            .all_vars()
            .first()
            .map_or(Device::Cpu, |v| v.device().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_loss_summary() {
        let mut single = EpochLoss::default();
        single.add(&["loss".into()], &[1.5]);
        single.add(&["loss".into()], &[0.5]);
        assert_eq!(single.summary(), "train loss: 2.0000");

        let mut multi = EpochLoss::default();
        multi.add(&["loss".into(), "cl".into()], &[1.0, 0.25]);
        let mut other = EpochLoss::default();
        other.add(&["loss".into(), "kl".into()], &[1.0, 0.5]);
        multi.merge(&other);
        assert_eq!(multi.summary(), "train_loss: 2.0000, train_cl: 0.2500, train_kl: 0.5000");
        assert!((multi.total() - 2.75).abs() < 1e-9);
    }
}
