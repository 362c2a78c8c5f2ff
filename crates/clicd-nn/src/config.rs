//! Model hyperparameters.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which contrastive objective the graph path optimizes.
///
/// | Mode | Terms |
/// |------|-------|
/// | `Adj` | agreement · grace(seq, adj) |
/// | `A2s` | personalization · grace(adj, sim) |
/// | `NoCl` | none |
/// | `Static` | 0.5 · (grace(seq, adj) + grace(adj, sim)) |
/// | `Full` | agreement · grace(seq, adj) + personalization · grace(adj, sim) |
/// | `PushAndPull` | agreement · grace(seq, adj) + 2·\|w − 0.5\| · push(adj, sim) |
/// | `VanillaLoss` | `Full` with cross-view InfoNCE instead of grace |
/// | `OneNeg` | `Full` with one-negative InfoNCE, scaled by 5 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ClAblation {
    Adj,
    A2s,
    NoCl,
    Static,
    Full,
    PushAndPull,
    VanillaLoss,
    OneNeg,
}

impl ClAblation {
    pub const ALL: [ClAblation; 8] = [
        Self::Adj,
        Self::A2s,
        Self::NoCl,
        Self::Static,
        Self::Full,
        Self::PushAndPull,
        Self::VanillaLoss,
        Self::OneNeg,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adj => "adj",
            Self::A2s => "a2s",
            Self::NoCl => "nocl",
            Self::Static => "static",
            Self::Full => "full",
            Self::PushAndPull => "pushandpull",
            Self::VanillaLoss => "vanilla_loss",
            Self::OneNeg => "one_neg",
        }
    }
}

impl FromStr for ClAblation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidConfig(format!("unknown cl_ablation `{s}`")))
    }
}

impl TryFrom<String> for ClAblation {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ClAblation> for String {
    fn from(m: ClAblation) -> String {
        m.as_str().to_string()
    }
}

impl fmt::Display for ClAblation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feed-forward activation in the transformer encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    Gelu,
    Relu,
    Swish,
    Tanh,
    Sigmoid,
}

impl FromStr for HiddenAct {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gelu" => Ok(Self::Gelu),
            "relu" => Ok(Self::Relu),
            "swish" | "silu" => Ok(Self::Swish),
            "tanh" => Ok(Self::Tanh),
            "sigmoid" => Ok(Self::Sigmoid),
            other => Err(Error::InvalidConfig(format!("unknown hidden_act `{other}`"))),
        }
    }
}

/// CLICD hyperparameters. Every field has a default, so a partial JSON
/// object is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClicdConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    pub hidden_size: usize,
    pub inner_size: usize,
    pub hidden_dropout_prob: f32,
    pub attn_dropout_prob: f32,
    pub hidden_act: HiddenAct,
    pub layer_norm_eps: f64,
    pub initializer_range: f64,
    pub max_seq_length: usize,
    /// Fraction of valid positions masked on the plain path.
    pub mask_ratio: f32,
    /// Temperature of the contrastive layer.
    pub cl_temp: f64,
    /// Fraction of edges zeroed by the GCN smoother while training.
    pub graph_dropout_prob: f32,
    /// Target batch mean of agreement weights.
    pub weight_mean: f64,
    pub kl_weight: f64,
    pub graphcl_coefficient: f64,
    pub cl_ablation: ClAblation,
    pub graph_view_fusion: bool,
    /// Use the graph-contrastive path instead of plain cloze training.
    pub graphcl_enable: bool,
    pub seed: u64,
}

impl Default for ClicdConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            n_heads: 2,
            hidden_size: 64,
            inner_size: 256,
            hidden_dropout_prob: 0.2,
            attn_dropout_prob: 0.2,
            hidden_act: HiddenAct::Gelu,
            layer_norm_eps: 1e-12,
            initializer_range: 0.02,
            max_seq_length: 50,
            mask_ratio: 0.2,
            cl_temp: 1.0,
            graph_dropout_prob: 0.3,
            weight_mean: 0.5,
            kl_weight: 1e-3,
            graphcl_coefficient: 1e-4,
            cl_ablation: ClAblation::Full,
            graph_view_fusion: true,
            graphcl_enable: true,
            seed: 2020,
        }
    }
}

impl ClicdConfig {
    pub fn with_hidden_size(mut self, hidden: usize) -> Self {
        self.hidden_size = hidden;
        self
    }

    pub fn with_layers(mut self, n_layers: usize, n_heads: usize) -> Self {
        self.n_layers = n_layers;
        self.n_heads = n_heads;
        self
    }

    pub fn with_inner_size(mut self, inner: usize) -> Self {
        self.inner_size = inner;
        self
    }

    pub fn with_max_seq_length(mut self, len: usize) -> Self {
        self.max_seq_length = len;
        self
    }

    pub fn with_dropout(mut self, hidden: f32, attn: f32) -> Self {
        self.hidden_dropout_prob = hidden;
        self.attn_dropout_prob = attn;
        self
    }

    pub fn with_cl_ablation(mut self, mode: ClAblation) -> Self {
        self.cl_ablation = mode;
        self
    }

    pub fn with_graphcl(mut self, enable: bool) -> Self {
        self.graphcl_enable = enable;
        self
    }

    pub fn with_view_fusion(mut self, enable: bool) -> Self {
        self.graph_view_fusion = enable;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject combinations that would fail mid-training.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.n_heads == 0 || self.hidden_size % self.n_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "hidden_size {} must be a positive multiple of n_heads {}",
                self.hidden_size, self.n_heads
            )));
        }
        if self.max_seq_length == 0 {
            return Err(Error::InvalidConfig("max_seq_length must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.mask_ratio) {
            return Err(Error::InvalidConfig(format!("mask_ratio {} not in [0, 1]", self.mask_ratio)));
        }
        if self.cl_temp <= 0.0 {
            return Err(Error::InvalidConfig(format!("cl_temp must be positive, got {}", self.cl_temp)));
        }
        if self.weight_mean <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "weight_mean must be positive, got {}",
                self.weight_mean
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ablation_parse_round_trip() {
        for mode in ClAblation::ALL {
            assert_eq!(mode.as_str().parse::<ClAblation>().unwrap(), mode);
        }
        assert!("everything".parse::<ClAblation>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: ClicdConfig = serde_json::from_str(r#"{"hidden_size": 32, "cl_ablation": "pushandpull"}"#).unwrap();
        assert_eq!(cfg.hidden_size, 32);
        assert_eq!(cfg.cl_ablation, ClAblation::PushAndPull);
        assert_eq!(cfg.n_heads, 2);
    }

    #[test]
    fn test_unknown_ablation_rejected_at_parse() {
        let res: std::result::Result<ClicdConfig, _> = serde_json::from_str(r#"{"cl_ablation": "bogus"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_heads() {
        assert!(ClicdConfig::default().with_hidden_size(30).with_layers(1, 4).validate().is_err());
        assert!(ClicdConfig::default().validate().is_ok());
    }
}
