//! Neural components of the CLICD recommender.
//!
//! `clicd-nn` sits between the data layer (`clicd-core`) and the trainers
//! (`clicd-train`). It owns every learnable piece and the [`Recommender`]
//! contract the trainers drive.
//!
//! # Modules
//!
//! - [`propagate`]: sparse weighted propagation as a candle custom op
//! - [`smoother`]: two-hop GCN smoothing with scoped edge dropout
//! - [`encoder`]: bidirectional transformer encoder
//! - [`contrastive`]: grace, push, vanilla and one-negative objectives
//! - [`agreement`]: per-sample agreement weights and their KL regularizer
//! - [`fusion`]: attention fusion of sequence and graph views
//! - [`recommender`]: the model capability trait and loss container
//! - [`model`]: the CLICD model
//!
//! # Example
//!
//! ```rust,ignore
//! use clicd_core::ExternalData;
//! use clicd_nn::{Clicd, ClicdConfig, Objective, Recommender};
//! use candle_core::Device;
//!
//! let data = ExternalData::from_sequences(num_items, &sequences, 10)?;
//! let mut model = Clicd::new(ClicdConfig::default(), num_items, data, &Device::Cpu)?;
//! let out = model.calculate_loss(Objective::Recommendation, &batch)?;
//! out.total()?.backward()?;
//! ```

#![allow(clippy::too_many_arguments)]

pub mod agreement;
pub mod config;
pub mod contrastive;
pub mod encoder;
mod error;
pub mod fusion;
pub mod model;
pub mod propagate;
pub mod recommender;
pub mod smoother;

pub use config::{ClAblation, ClicdConfig, HiddenAct};
pub use error::{Error, Result};
pub use model::{Clicd, GraphView, MODEL_NAME};
pub use recommender::{
    ensure_finite, named_vars, LossOutput, MetaParams, Objective, OptimizerSlot, ParamId, Recommender,
};
