//! Trainer and meta-trainer configuration.
//!
//! Every struct is `#[serde(default)]`, so a JSON file only needs the keys
//! it overrides:
//!
//! ```json
//! { "learner": "adam", "learning_rate": 0.001, "epochs": 50, "stopping_step": 5 }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Learner {
    Adam,
    Sgd,
    Adagrad,
    RmsProp,
    SparseAdam,
}

impl Learner {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::Sgd => "sgd",
            Self::Adagrad => "adagrad",
            Self::RmsProp => "rmsprop",
            Self::SparseAdam => "sparse_adam",
        }
    }

    /// Parse a learner name, falling back to Adam with a warning.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!("Received unrecognized optimizer `{name}`, set default Adam optimizer");
            Self::Adam
        })
    }
}

impl FromStr for Learner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            "adagrad" => Ok(Self::Adagrad),
            "rmsprop" => Ok(Self::RmsProp),
            "sparse_adam" | "sparseadam" => Ok(Self::SparseAdam),
            other => Err(Error::InvalidConfig(format!("unknown learner `{other}`"))),
        }
    }
}

/// Gradient clipping by global norm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipGradNorm {
    pub max_norm: f64,
    pub norm_type: f64,
}

impl Default for ClipGradNorm {
    fn default() -> Self {
        Self {
            max_norm: 5.0,
            norm_type: 2.0,
        }
    }
}

/// Whether evaluation scores points (`Value`) or ranks candidates (`Ranking`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    Value,
    #[default]
    Ranking,
}

/// Settings of the epoch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub model_name: String,
    pub dataset_name: String,
    /// Optimizer name; unknown names fall back to Adam.
    pub learner: String,
    pub learning_rate: f64,
    pub epochs: usize,
    pub train_batch_size: usize,
    /// Evaluate every `eval_step` epochs; 0 disables validation.
    pub eval_step: usize,
    /// Early-stopping patience in evaluations.
    pub stopping_step: usize,
    pub clip_grad_norm: Option<ClipGradNorm>,
    /// Metric key used for model selection, e.g. `mrr@10`.
    pub valid_metric: String,
    pub valid_metric_bigger: bool,
    pub eval_batch_size: usize,
    pub eval_type: EvalType,
    pub topk: Vec<usize>,
    pub checkpoint_dir: PathBuf,
    pub weight_decay: f64,
    pub reg_weight: Option<f64>,
    pub seed: u64,
    /// Snapshot interval for pretraining.
    pub save_step: usize,
    pub train_rec_step: Option<usize>,
    pub train_kg_step: Option<usize>,
    pub kge_interval: usize,
    pub encoder_steps: usize,
    pub decoder_steps: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            model_name: clicd_nn::MODEL_NAME.to_string(),
            dataset_name: "dataset".to_string(),
            learner: "adam".to_string(),
            learning_rate: 1e-3,
            epochs: 300,
            train_batch_size: 256,
            eval_step: 1,
            stopping_step: 10,
            clip_grad_norm: None,
            valid_metric: "mrr@10".to_string(),
            valid_metric_bigger: true,
            eval_batch_size: 4096,
            eval_type: EvalType::Ranking,
            topk: vec![5, 10, 20],
            checkpoint_dir: PathBuf::from("saved"),
            weight_decay: 0.0,
            reg_weight: None,
            seed: 2020,
            save_step: 10,
            train_rec_step: None,
            train_kg_step: None,
            kge_interval: 3,
            encoder_steps: 3,
            decoder_steps: 1,
        }
    }
}

impl TrainerConfig {
    pub fn with_names(mut self, model: impl Into<String>, dataset: impl Into<String>) -> Self {
        self.model_name = model.into();
        self.dataset_name = dataset.into();
        self
    }

    pub fn with_learner(mut self, learner: impl Into<String>) -> Self {
        self.learner = learner.into();
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_sizes(mut self, train: usize, eval: usize) -> Self {
        self.train_batch_size = train;
        self.eval_batch_size = eval;
        self
    }

    pub fn with_eval_step(mut self, eval_step: usize) -> Self {
        self.eval_step = eval_step;
        self
    }

    pub fn with_stopping_step(mut self, patience: usize) -> Self {
        self.stopping_step = patience;
        self
    }

    pub fn with_clip_grad_norm(mut self, clip: ClipGradNorm) -> Self {
        self.clip_grad_norm = Some(clip);
        self
    }

    pub fn with_valid_metric(mut self, metric: impl Into<String>, bigger: bool) -> Self {
        self.valid_metric = metric.into();
        self.valid_metric_bigger = bigger;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// `<checkpoint_dir>/<model>-<dataset>.ckpt`
    pub fn saved_model_file(&self) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}-{}.ckpt", self.model_name, self.dataset_name))
    }

    /// `<checkpoint_dir>/<model>-<dataset>-<epoch>.ckpt`
    pub fn pretrain_file(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{}-{}-{}.ckpt", self.model_name, self.dataset_name, epoch))
    }

    pub fn validate(&self) -> Result<()> {
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(Error::InvalidConfig("batch sizes must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(clip) = self.clip_grad_norm {
            if !(clip.max_norm > 0.0) || !(clip.norm_type > 0.0) {
                return Err(Error::InvalidConfig("clip_grad_norm needs positive max_norm and norm_type".into()));
            }
        }
        Ok(())
    }
}

/// Sub-sequence lengths that define meta tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLengths {
    Fixed(Vec<usize>),
    /// Truncated normal on `[a, b]`.
    Sampled { a: f64, b: f64, std: f64, mean: f64 },
}

impl Default for TaskLengths {
    fn default() -> Self {
        Self::Sampled {
            a: 3.0,
            b: 50.0,
            std: 7.0,
            mean: 6.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub meta_task_lengths: TaskLengths,
    /// Inner-loop step size.
    pub meta_update_lr: f64,
    /// Inner-loop steps per task.
    pub meta_update_step: usize,
    /// Weight decay of the outer optimizer.
    pub meta_decay: f64,
    pub meta_lr: f64,
    /// Outer steps of standalone meta-pretraining; 0 skips it.
    pub meta_pretrain_step: usize,
    /// Rows per task in one outer step.
    pub meta_batch_size: usize,
    /// Support/query pairs kept per task length.
    pub meta_shots: usize,
    /// Add one meta episode to every ordinary training batch.
    pub interleave: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            meta_task_lengths: TaskLengths::default(),
            meta_update_lr: 1e-2,
            meta_update_step: 1,
            meta_decay: 0.0,
            meta_lr: 1e-3,
            meta_pretrain_step: 0,
            meta_batch_size: 32,
            meta_shots: 64,
            interleave: false,
        }
    }
}

impl MetaConfig {
    pub fn with_task_lengths(mut self, lengths: TaskLengths) -> Self {
        self.meta_task_lengths = lengths;
        self
    }

    pub fn with_update(mut self, lr: f64, steps: usize) -> Self {
        self.meta_update_lr = lr;
        self.meta_update_step = steps;
        self
    }

    pub fn with_pretrain_steps(mut self, steps: usize) -> Self {
        self.meta_pretrain_step = steps;
        self
    }

    pub fn with_batch(mut self, batch_size: usize, shots: usize) -> Self {
        self.meta_batch_size = batch_size;
        self.meta_shots = shots;
        self
    }

    pub fn with_interleave(mut self, interleave: bool) -> Self {
        self.interleave = interleave;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.meta_update_step == 0 {
            return Err(Error::InvalidConfig("meta_update_step must be at least 1".into()));
        }
        if self.meta_batch_size == 0 || self.meta_shots == 0 {
            return Err(Error::InvalidConfig("meta_batch_size and meta_shots must be positive".into()));
        }
        match &self.meta_task_lengths {
            TaskLengths::Fixed(lens) if lens.is_empty() || lens.contains(&0) => Err(Error::InvalidConfig(
                "fixed meta task lengths must be non-empty and positive".into(),
            )),
            TaskLengths::Sampled { a, b, std, .. } if !(a < b) || !(*std > 0.0) || *b < 1.0 => Err(
                Error::InvalidConfig(format!("bad task length distribution: a={a}, b={b}, std={std}")),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learner_fallback() {
        assert_eq!(Learner::parse_or_default("RMSprop"), Learner::RmsProp);
        assert_eq!(Learner::parse_or_default("lion"), Learner::Adam);
        assert!("lion".parse::<Learner>().is_err());
    }

    #[test]
    fn test_partial_json() {
        let cfg: TrainerConfig = serde_json::from_str(r#"{"epochs": 7, "learner": "sgd"}"#).unwrap();
        assert_eq!(cfg.epochs, 7);
        assert_eq!(cfg.stopping_step, 10);
        let meta: MetaConfig = serde_json::from_str(r#"{"meta_task_lengths": {"fixed": [5, 10]}}"#).unwrap();
        assert_eq!(meta.meta_task_lengths, TaskLengths::Fixed(vec![5, 10]));
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_file_names() {
        let cfg = TrainerConfig::default()
            .with_names("CLICD", "ml-1m")
            .with_checkpoint_dir("out");
        assert_eq!(cfg.saved_model_file(), PathBuf::from("out/CLICD-ml-1m.ckpt"));
        assert_eq!(cfg.pretrain_file(3), PathBuf::from("out/CLICD-ml-1m-3.ckpt"));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        assert!(TrainerConfig::default().with_batch_sizes(0, 1).validate().is_err());
        assert!(MetaConfig::default().with_task_lengths(TaskLengths::Fixed(vec![])).validate().is_err());
    }
}
