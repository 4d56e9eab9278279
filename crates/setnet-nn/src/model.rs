//! Architecture selection.
//!
//! [`ModelConfig`] is the serialized form of a model choice, tagged by the
//! `model` key:
//!
//! ```toml
//! model = "dmps"
//! blocks = ["plain", "denoising", "residual"]
//! extraction_width = 256
//! ```

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::deep_sets::{DeepSetsConfig, DeepSetsModel};
use crate::dmps::{DmpsConfig, DmpsModel};
use crate::error::Result;
use crate::SetEncoder;

/// Which set encoder to build, with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum ModelConfig {
    DeepSets(DeepSetsConfig),
    Dmps(DmpsConfig),
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::DeepSets(DeepSetsConfig::default())
    }
}

impl ModelConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ModelConfig::DeepSets(_) => "deepsets",
            ModelConfig::Dmps(_) => "dmps",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ModelConfig::DeepSets(c) => c.validate(),
            ModelConfig::Dmps(c) => c.validate(),
        }
    }
}

/// A built set encoder of either architecture.
#[derive(Debug, Clone)]
pub enum SetModel {
    DeepSets(DeepSetsModel),
    Dmps(DmpsModel),
}

impl SetModel {
    /// Build the configured model for elements of width `in_features`.
    pub fn build(config: &ModelConfig, in_features: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match config {
            ModelConfig::DeepSets(c) => SetModel::DeepSets(DeepSetsModel::new(c, in_features, vb)?),
            ModelConfig::Dmps(c) => SetModel::Dmps(DmpsModel::new(c, in_features, vb)?),
        })
    }

    /// Inference-mode forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.encode(x, false)
    }
}

impl SetEncoder for SetModel {
    fn input_dim(&self) -> usize {
        match self {
            SetModel::DeepSets(m) => m.input_dim(),
            SetModel::Dmps(m) => m.input_dim(),
        }
    }

    fn output_dim(&self) -> usize {
        match self {
            SetModel::DeepSets(m) => m.output_dim(),
            SetModel::Dmps(m) => m.output_dim(),
        }
    }

    fn encode(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            SetModel::DeepSets(m) => m.encode(x, train),
            SetModel::Dmps(m) => m.encode(x, train),
        }
    }
}
