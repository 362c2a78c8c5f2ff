//! First-order MAML over sequence-length tasks.
//!
//! A task is a sub-sequence length. Every training sequence long enough for
//! at least two chunks of some task length is cut into consecutive chunks;
//! chunk `i` is a support example and chunk `i + 1` its query.
//!
//! ```text
//! seq (len 20), task length 5:  [a a a a a][b b b b b][c c c c c][d d d d d]
//! pairs:                        (a, b)  (b, c)  (c, d)
//! ```
//!
//! The inner loop adapts only the model's meta parameters. Adapted values
//! are the live parameters plus a detached offset, so query gradients land
//! on the live parameters directly.

use crate::config::{MetaConfig, TaskLengths};
use crate::optim::{CosineAnnealing, OptimizerConfig, TrainOptimizer};
use crate::trainer::{AuxiliaryLoss, EpochReport, FitOutcome, Trainer};
use crate::{Error, Learner, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Optimizer;
use clicd_core::interaction::{ITEM_SEQ, ITEM_SEQ_LEN};
use clicd_core::{EvalLoader, Interaction, SequenceLoader};
use clicd_nn::{ensure_finite, named_vars, Recommender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::info;

/// Lengths drawn per sampling round.
pub const SAMPLED_TASK_COUNT: usize = 5;
/// Floor of the cosine schedule during meta-pretraining.
pub const META_ETA_MIN: f64 = 1e-4;
const MAX_REJECTIONS: usize = 10_000;
const MIN_STEP_WEIGHT: f64 = 0.03;

/// Task lengths, deduplicated and ascending.
pub fn sample_task_lengths<R: Rng + ?Sized>(task_lengths: &TaskLengths, rng: &mut R) -> Result<Vec<usize>> {
    let mut lengths = match task_lengths {
        TaskLengths::Fixed(lengths) => lengths.clone(),
        TaskLengths::Sampled { a, b, std, mean } => {
            let normal = Normal::new(*mean, *std)
                .map_err(|e| Error::InvalidConfig(format!("task length distribution: {e}")))?;
            let mut out = Vec::with_capacity(SAMPLED_TASK_COUNT);
            let mut tries = 0;
            while out.len() < SAMPLED_TASK_COUNT {
                tries += 1;
                if tries > MAX_REJECTIONS {
                    return Err(Error::InvalidConfig(format!(
                        "task length distribution N({mean}, {std}) rarely falls in [{a}, {b}]"
                    )));
                }
                let x: f64 = normal.sample(rng);
                if (*a..=*b).contains(&x) {
                    out.push(x as usize);
                }
            }
            out
        }
    };
    lengths.retain(|&l| l > 0);
    lengths.sort_unstable();
    lengths.dedup();
    if lengths.is_empty() {
        return Err(Error::InvalidConfig("no positive meta task length".into()));
    }
    Ok(lengths)
}

/// Support/query pairs of one sequence at one task length, zero-padded to
/// `padding_len`. Only whole chunks count.
pub fn split_sequence(seq: &[u32], task_len: usize, padding_len: usize) -> Vec<(Vec<u32>, Vec<u32>)> {
    if task_len == 0 {
        return Vec::new();
    }
    let pad = |chunk: &[u32]| {
        let mut row = chunk.to_vec();
        row.resize(padding_len.max(task_len), 0);
        row
    };
    let chunks: Vec<&[u32]> = seq.chunks_exact(task_len).collect();
    chunks.windows(2).map(|w| (pad(w[0]), pad(w[1]))).collect()
}

/// Pairs grouped by task length.
pub type TaskPool = BTreeMap<usize, Vec<(Vec<u32>, Vec<u32>)>>;

/// Cut every eligible sequence at one randomly chosen task length.
///
/// A sequence shorter than twice the smallest length is skipped; otherwise
/// the length is drawn among those it can hold twice.
pub fn build_tasks<R: Rng + ?Sized>(
    sequences: &[Vec<u32>],
    lengths: &[usize],
    padding_len: usize,
    rng: &mut R,
) -> TaskPool {
    let mut pool = TaskPool::new();
    let Some(&shortest) = lengths.first() else {
        return pool;
    };
    for seq in sequences {
        if seq.len() < 2 * shortest {
            continue;
        }
        let eligible: Vec<usize> = lengths.iter().copied().filter(|&l| seq.len() >= 2 * l).collect();
        let Some(&task_len) = eligible.choose(rng) else {
            continue;
        };
        pool.entry(task_len)
            .or_default()
            .extend(split_sequence(seq, task_len, padding_len));
    }
    pool
}

/// Valid (unpadded) prefix of every row of a batch.
fn batch_sequences(batch: &Interaction) -> Result<Vec<Vec<u32>>> {
    let seqs = batch.u32_rows(ITEM_SEQ)?;
    let lens = batch.u32_column(ITEM_SEQ_LEN)?;
    Ok(seqs
        .into_iter()
        .zip(lens)
        .map(|(mut s, l)| {
            s.truncate(l as usize);
            s
        })
        .collect())
}

/// Per-step weights of the query losses. Starts uniform and moves toward the
/// final step as `epoch` grows; every non-final step keeps at least `0.03 / n`.
pub fn importance_vector(n_steps: usize, epoch: usize, pretrain_steps: usize) -> Vec<f64> {
    let n = n_steps.max(1);
    let nf = n as f64;
    let decay = 1.0 / nf / pretrain_steps.max(1) as f64;
    let floor = MIN_STEP_WEIGHT / nf;
    let e = epoch as f64;
    let mut weights: Vec<f64> = (0..n - 1).map(|_| (1.0 / nf - e * decay).max(floor)).collect();
    weights.push((1.0 / nf + e * (nf - 1.0) * decay).min(1.0 - (nf - 1.0) * floor));
    weights
}

/// One task's rows in an outer step.
#[derive(Debug, Clone)]
pub struct TaskBatch {
    pub task_len: usize,
    /// Index of the task length, used as the model's task label.
    pub label: usize,
    pub support: Tensor,
    pub query: Tensor,
}

/// Everything the meta-trainer samples and computes.
#[derive(Debug, Clone)]
pub struct MetaLearner {
    config: MetaConfig,
    lengths: Vec<usize>,
    rng: StdRng,
}

impl MetaLearner {
    pub fn new(config: MetaConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let lengths = sample_task_lengths(&config.meta_task_lengths, &mut rng)?;
        info!("meta task lengths: {lengths:?}");
        Ok(Self { config, lengths, rng })
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    pub fn task_lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Longest task length; every chunk is padded to it.
    pub fn padding_len(&self) -> usize {
        self.lengths.last().copied().unwrap_or(0)
    }

    /// Draw new lengths when they are sampled rather than fixed.
    pub fn resample_lengths(&mut self) -> Result<()> {
        if matches!(self.config.meta_task_lengths, TaskLengths::Sampled { .. }) {
            self.lengths = sample_task_lengths(&self.config.meta_task_lengths, &mut self.rng)?;
        }
        Ok(())
    }

    pub fn tasks_from_batch(&mut self, batch: &Interaction) -> Result<TaskPool> {
        let seqs = batch_sequences(batch)?;
        Ok(build_tasks(&seqs, &self.lengths, self.padding_len(), &mut self.rng))
    }

    /// Merge pools, shuffle each task's pairs and keep at most `shots`.
    pub fn flatten(&mut self, pools: Vec<TaskPool>, shots: usize) -> TaskPool {
        let mut merged = TaskPool::new();
        for pool in pools {
            for (len, pairs) in pool {
                merged.entry(len).or_default().extend(pairs);
            }
        }
        for pairs in merged.values_mut() {
            pairs.shuffle(&mut self.rng);
            pairs.truncate(shots);
        }
        let counts: Vec<String> = self
            .lengths
            .iter()
            .map(|l| format!("|{l}|: {}", merged.get(l).map_or(0, Vec::len)))
            .collect();
        info!("shot counts: {}", counts.join("\t"));
        merged
    }

    /// Split a pool into outer-step episodes of `batch_size` rows per task.
    /// Episode `i` holds rows `[i * batch_size, (i + 1) * batch_size)` of
    /// every task that still has them.
    pub fn episodes(&self, pool: &TaskPool, batch_size: usize, device: &Device) -> Result<Vec<Vec<TaskBatch>>> {
        let batch_size = batch_size.max(1);
        let n_episodes = pool.values().map(|p| p.len().div_ceil(batch_size)).max().unwrap_or(0);
        let mut episodes = Vec::with_capacity(n_episodes);
        for i in 0..n_episodes {
            let mut episode = Vec::new();
            for (&task_len, pairs) in pool {
                let start = i * batch_size;
                if start >= pairs.len() {
                    continue;
                }
                let rows = &pairs[start..(start + batch_size).min(pairs.len())];
                episode.push(self.task_batch(task_len, rows, device)?);
            }
            episodes.push(episode);
        }
        Ok(episodes)
    }

    fn task_batch(&self, task_len: usize, rows: &[(Vec<u32>, Vec<u32>)], device: &Device) -> Result<TaskBatch> {
        let width = rows.first().map_or(0, |(s, _)| s.len());
        let support: Vec<u32> = rows.iter().flat_map(|(s, _)| s.iter().copied()).collect();
        let query: Vec<u32> = rows.iter().flat_map(|(_, q)| q.iter().copied()).collect();
        Ok(TaskBatch {
            task_len,
            label: self.lengths.iter().position(|&l| l == task_len).unwrap_or(0),
            support: Tensor::from_vec(support, (rows.len(), width), device)?,
            query: Tensor::from_vec(query, (rows.len(), width), device)?,
        })
    }

    pub fn importance(&self, epoch: usize) -> Vec<f64> {
        importance_vector(self.config.meta_update_step, epoch, self.config.meta_pretrain_step)
    }

    /// Importance-weighted query loss of one episode, averaged over tasks.
    ///
    /// Each task starts from the live parameters and takes
    /// `meta_update_step` support steps; the query loss after step `k` is
    /// accumulated into slot `k`.
    pub fn meta_loss<M: Recommender + ?Sized>(
        &self,
        model: &mut M,
        episode: &[TaskBatch],
        importance: &[f64],
    ) -> Result<Tensor> {
        let live = model.meta_params()?;
        let steps = self.config.meta_update_step;
        let lr = self.config.meta_update_lr;
        let mut losses_q: Vec<Option<Tensor>> = vec![None; steps];

        for task in episode {
            let mut adapted: Vec<Tensor> = live.iter().map(|(_, t)| t.clone()).collect();
            for slot in losses_q.iter_mut() {
                let params = live.with_values(adapted.clone())?;
                let loss = model.calculate_meta_loss(&task.support, task.label, &params)?;
                let grads = loss.backward()?;
                adapted = live
                    .iter()
                    .zip(&adapted)
                    .map(|((_, theta), current)| -> Result<Tensor> {
                        // adapted = theta + const, so d(loss)/d(theta) is the gradient w.r.t. adapted
                        let Some(g) = grads.get(theta) else {
                            return Ok(current.clone());
                        };
                        let next = (current.detach() - g.affine(lr, 0.0)?)?;
                        let offset = (next - theta.detach())?.detach();
                        Ok((theta + offset)?)
                    })
                    .collect::<Result<Vec<_>>>()?;

                let params = live.with_values(adapted.clone())?;
                let loss_q = model.calculate_meta_loss(&task.query, task.label, &params)?;
                *slot = Some(match slot.take() {
                    Some(acc) => (acc + loss_q)?,
                    None => loss_q,
                });
            }
        }

        let mut total: Option<Tensor> = None;
        for (loss, &w) in losses_q.into_iter().zip(importance) {
            let Some(loss) = loss else { continue };
            let weighted = loss.affine(w, 0.0)?;
            total = Some(match total {
                Some(t) => (t + weighted)?,
                None => weighted,
            });
        }
        let Some(total) = total else {
            return Ok(Tensor::zeros((), DType::F32, &Device::Cpu)?);
        };
        let loss = total.affine(1.0 / episode.len().max(1) as f64, 0.0)?;
        ensure_finite(&loss, "meta query loss")?;
        Ok(loss)
    }
}

/// Interleaved mode: every training batch also yields one meta episode.
impl<M: Recommender> AuxiliaryLoss<M> for MetaLearner {
    fn name(&self) -> &str {
        "meta"
    }

    fn batch_loss(&mut self, model: &mut M, batch: &Interaction, epoch: usize) -> Result<Option<Tensor>> {
        let pool = self.tasks_from_batch(batch)?;
        if pool.is_empty() {
            return Ok(None);
        }
        let episode: Vec<TaskBatch> = pool
            .iter()
            .map(|(&len, pairs)| self.task_batch(len, pairs, &batch.device()))
            .collect::<Result<_>>()?;
        let importance = self.importance(epoch);
        self.meta_loss(model, &episode, &importance).map(Some)
    }
}

/// A learner shared with the trainer's per-batch term, so interleaved
/// episodes see lengths resampled during pretraining.
impl<M: Recommender> AuxiliaryLoss<M> for Rc<RefCell<MetaLearner>> {
    fn name(&self) -> &str {
        "meta"
    }

    fn batch_loss(&mut self, model: &mut M, batch: &Interaction, epoch: usize) -> Result<Option<Tensor>> {
        AuxiliaryLoss::<M>::batch_loss(&mut *self.borrow_mut(), model, batch, epoch)
    }
}

/// A [`Trainer`] preceded by standalone meta-pretraining, optionally adding
/// a meta episode to every batch afterwards.
pub struct MetaTrainer<M: Recommender> {
    trainer: Trainer<M>,
    learner: Rc<RefCell<MetaLearner>>,
    meta_optimizer: TrainOptimizer,
    scheduler: CosineAnnealing,
}

impl<M: Recommender> MetaTrainer<M> {
    pub fn new(mut trainer: Trainer<M>, config: MetaConfig) -> Result<Self> {
        let learner = MetaLearner::new(config, trainer.config().seed)?;
        let meta = learner.config().clone();
        let opt_config = OptimizerConfig::new(Learner::Adam, meta.meta_lr, meta.meta_decay);
        let meta_optimizer = TrainOptimizer::from_named(named_vars(trainer.model().varmap()), opt_config)?;
        let scheduler = CosineAnnealing::new(meta.meta_lr, meta.meta_pretrain_step, META_ETA_MIN);
        let learner = Rc::new(RefCell::new(learner));
        if meta.interleave {
            trainer.set_auxiliary_loss(Box::new(Rc::clone(&learner)));
        }
        Ok(Self {
            trainer,
            learner,
            meta_optimizer,
            scheduler,
        })
    }

    pub fn trainer(&self) -> &Trainer<M> {
        &self.trainer
    }

    pub fn trainer_mut(&mut self) -> &mut Trainer<M> {
        &mut self.trainer
    }

    pub fn learner(&self) -> Ref<'_, MetaLearner> {
        self.learner.borrow()
    }

    /// Run `meta_pretrain_step` outer epochs. Returns the summed meta loss of
    /// each.
    pub fn pretrain(&mut self, train: &mut SequenceLoader) -> Result<Vec<f64>> {
        let mut learner = self.learner.borrow_mut();
        let steps = learner.config().meta_pretrain_step;
        let shots = learner.config().meta_shots;
        let batch_size = learner.config().meta_batch_size;
        let mut history = Vec::with_capacity(steps);

        for epoch in 0..steps {
            learner.resample_lengths()?;
            let batches = train.batches()?;
            let device = batches.first().map_or(Device::Cpu, Interaction::device);
            let pools = batches
                .iter()
                .map(|b| learner.tasks_from_batch(b))
                .collect::<Result<Vec<_>>>()?;
            let pool = learner.flatten(pools, shots);
            let episodes = learner.episodes(&pool, batch_size, &device)?;
            let importance = learner.importance(epoch);

            let model = self.trainer.model_mut();
            model.set_training(true);
            let mut total = 0.0;
            for (i, episode) in episodes.iter().enumerate() {
                let loss = learner.meta_loss(model, episode, &importance)?;
                let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                if !value.is_finite() {
                    return Err(Error::NonFiniteLoss { epoch, batch: i });
                }
                total += f64::from(value);
                let grads = loss.backward()?;
                self.meta_optimizer.step(&grads)?;
            }
            let lr = self.scheduler.step(&mut self.meta_optimizer);
            info!("epoch {epoch} meta pretraining [train loss: {total:.4}, lr: {lr:.6}]");
            history.push(total);
        }
        Ok(history)
    }

    pub fn fit(&mut self, train: &mut SequenceLoader, valid: Option<&EvalLoader>) -> Result<FitOutcome> {
        self.fit_with_progress(train, valid, |_| {})
    }

    /// Meta-pretraining followed by the ordinary epoch loop.
    pub fn fit_with_progress<F: FnMut(&EpochReport)>(
        &mut self,
        train: &mut SequenceLoader,
        valid: Option<&EvalLoader>,
        on_epoch: F,
    ) -> Result<FitOutcome> {
        self.pretrain(train)?;
        self.trainer.fit_with_progress(train, valid, on_epoch)
    }

    pub fn into_trainer(self) -> Trainer<M> {
        self.trainer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_counts() {
        let seq: Vec<u32> = (1..=20).collect();
        let pairs = split_sequence(&seq, 5, 7);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, vec![1, 2, 3, 4, 5, 0, 0]);
        assert_eq!(pairs[2].1[..5], [16, 17, 18, 19, 20]);
    }

    #[test]
    fn test_short_sequences_skipped() {
        let mut rng = StdRng::seed_from_u64(0);
        let pool = build_tasks(&[(1..=9).collect()], &[5, 8], 8, &mut rng);
        assert!(pool.is_empty());
        let pool = build_tasks(&[(1..=12).collect()], &[5, 8], 8, &mut rng);
        assert_eq!(pool.keys().copied().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_sampled_lengths_sorted_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let spec = TaskLengths::Sampled {
            a: 3.0,
            b: 50.0,
            std: 7.0,
            mean: 6.0,
        };
        let lens = sample_task_lengths(&spec, &mut rng).unwrap();
        assert!(!lens.is_empty() && lens.len() <= SAMPLED_TASK_COUNT);
        assert!(lens.windows(2).all(|w| w[0] < w[1]));
        assert!(lens.iter().all(|&l| (3..=50).contains(&l)));
    }

    #[test]
    fn test_importance_vector() {
        let w = importance_vector(3, 0, 10);
        assert!(w.iter().all(|&x| (x - 1.0 / 3.0).abs() < 1e-12));
        let late = importance_vector(3, 100, 10);
        assert!((late[0] - 0.01).abs() < 1e-12);
        assert!((late[2] - (1.0 - 2.0 * 0.01)).abs() < 1e-12);
        assert_eq!(importance_vector(1, 5, 0), vec![1.0]);
    }

    #[test]
    fn test_shared_learner_sees_resampled_lengths() {
        let config = MetaConfig::default().with_task_lengths(TaskLengths::Sampled {
            a: 3.0,
            b: 50.0,
            std: 7.0,
            mean: 6.0,
        });
        let shared = Rc::new(RefCell::new(MetaLearner::new(config, 3).unwrap()));
        let handle = Rc::clone(&shared);
        let initial = handle.borrow().task_lengths().to_vec();
        let mut changed = false;
        for _ in 0..10 {
            shared.borrow_mut().resample_lengths().unwrap();
            assert_eq!(handle.borrow().task_lengths(), shared.borrow().task_lengths());
            changed |= handle.borrow().task_lengths() != initial.as_slice();
        }
        assert!(changed);
    }

    #[test]
    fn test_flatten_caps_shots() {
        let mut learner = MetaLearner::new(
            MetaConfig::default().with_task_lengths(TaskLengths::Fixed(vec![2])),
            1,
        )
        .unwrap();
        let pool: TaskPool = [(2, vec![(vec![1, 2], vec![3, 4]); 5])].into_iter().collect();
        let merged = learner.flatten(vec![pool.clone(), pool], 7);
        assert_eq!(merged[&2].len(), 7);
        let episodes = learner.episodes(&merged, 3, &Device::Cpu).unwrap();
        assert_eq!(episodes.len(), 3);
        assert_eq!(episodes[2][0].support.dims(), &[1, 2]);
    }
}
