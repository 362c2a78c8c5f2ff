//! Training, evaluation and meta-learning for `clicd-nn` recommenders.
//!
//! - [`trainer`]: the epoch loop with validation, early stopping and checkpoints
//! - [`schedule`]: which objective and optimizer each epoch runs
//! - [`optim`]: SGD, Adagrad, RMSprop, Adam and sparse Adam over candle `Var`s
//! - [`evaluation`]: full-sort, fast-sample and negative-sample scoring, metrics
//! - [`checkpoint`]: bincode checkpoints of model and optimizer state
//! - [`meta`]: first-order MAML over sequence-length tasks
//!
//! # Example
//!
//! ```rust,ignore
//! use clicd_train::{MetaConfig, MetaTrainer, Trainer, TrainerConfig};
//!
//! let trainer = Trainer::new(TrainerConfig::default().with_epochs(20), model)?;
//! let mut meta = MetaTrainer::new(trainer, MetaConfig::default().with_pretrain_steps(5))?;
//! let outcome = meta.fit(&mut train_loader, Some(&valid_loader))?;
//! println!("best mrr@10 = {:.4}", outcome.best_valid_score);
//! ```

#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod config;
pub mod early_stopping;
mod error;
pub mod evaluation;
pub mod meta;
pub mod optim;
pub mod schedule;
pub mod trainer;

pub use checkpoint::{Checkpoint, TensorRecord};
pub use config::{ClipGradNorm, EvalType, Learner, MetaConfig, TaskLengths, TrainerConfig};
pub use early_stopping::{early_stopping, StopDecision};
pub use error::{Error, Result};
pub use evaluation::{split_predict, EvalResult, RankingEvaluator, ScoredBatch};
pub use meta::{MetaLearner, MetaTrainer};
pub use optim::{CosineAnnealing, MomentRecord, OptimizerConfig, OptimizerState, TrainOptimizer};
pub use schedule::{EpochSchedule, Phase};
pub use trainer::{AuxiliaryLoss, EpochLoss, EpochReport, FitOutcome, Trainer};
