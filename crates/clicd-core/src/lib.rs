// Allow minor clippy style warnings at crate level
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_name_repetitions)]

//! Core data types for graph-contrastive sequential recommendation.
//!
//! This crate holds everything that is not a neural network:
//!
//! - [`Interaction`] - named tensor fields aligned on the batch axis
//! - [`ItemGraph`] - weighted directed item graph (petgraph-backed)
//! - [`augment`] - batch augmentation, edge dropout, masking, scoped restore
//! - [`readout`] - mean-pooled neighbor readouts (plain and civil/foreign)
//! - [`data`] - the external data bundle and builders for it
//! - [`dataset`] - in-memory sequential dataset and loaders
//!
//! # Example
//!
//! ```rust
//! use clicd_core::{graph_augment, ItemGraph, UserEdgeIndex};
//!
//! let base = ItemGraph::from_edges(4, [(1, 2, 1.0), (2, 3, 1.0)]).unwrap();
//! let mut users = UserEdgeIndex::new();
//! users.insert(10, [(1, 2)]);
//!
//! let aug = graph_augment(&base, &[10], &users);
//! assert_eq!(aug.edge_count(), 1);
//! assert_eq!(base.edge_count(), 2);
//! ```

pub mod augment;
pub mod data;
pub mod dataset;
mod error;
mod graph;
pub mod interaction;
pub mod readout;

pub use augment::{graph_augment, graph_dropout, graph_mask, with_edge_dropout, EdgeDropoutGuard, UserEdgeIndex};
pub use data::ExternalData;
pub use dataset::{EvalBatch, EvalKind, EvalLoader, SequenceLoader, SequentialDataset};
pub use error::{Error, Result};
pub use graph::ItemGraph;
pub use interaction::Interaction;
pub use readout::{graph_dual_neighbor_readout, graph_neighbor_readout, DualReadout, PoolingPlan};

// Re-export petgraph for callers that need raw graph algorithms
pub use petgraph;
