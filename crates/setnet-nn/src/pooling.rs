//! Set pooling head.
//!
//! Reduces `(B, N, F)` to one vector per set with an element-wise max over
//! the set axis. Max is a symmetric function, so the result is identical
//! (not merely permuted) under any reordering of the elements.
//!
//! An optional refinement stage can follow the pool:
//!
//! ```text
//! dropout(p) -> dense(hidden, act) -> dropout(p) -> dense(out, identity)
//! ```
//!
//! It is disabled unless [`PoolingConfig::refine`] is set.

use candle_core::Tensor;
use candle_nn::{Dropout, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::row_wise::RowWiseMlp;
use crate::set::max_pool;

/// Refinement stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    /// Width of the hidden dense layer (default: 40).
    pub hidden: usize,
    /// Width of the final identity projection (default: 40).
    pub out: usize,
    /// Drop probability applied before each dense layer (default: 0.5).
    pub dropout: f32,
    /// Activation of the hidden layer (default: tanh).
    pub activation: Activation,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            hidden: 40,
            out: 40,
            dropout: 0.5,
            activation: Activation::Tanh,
        }
    }
}

impl RefineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hidden == 0 || self.out == 0 {
            return Err(Error::InvalidConfig("refinement widths must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Pooling head settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingConfig {
    /// Refinement after the pool; `None` pools only (default).
    pub refine: Option<RefineConfig>,
}

impl PoolingConfig {
    pub fn pool_only() -> Self {
        Self { refine: None }
    }

    pub fn with_refine(refine: RefineConfig) -> Self {
        Self {
            refine: Some(refine),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.refine {
            Some(r) => r.validate(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct Refinement {
    dropout: Dropout,
    hidden: RowWiseMlp,
    project: RowWiseMlp,
}

/// Max-pool over the set axis, optionally followed by refinement.
#[derive(Debug, Clone)]
pub struct SetPoolingHead {
    in_features: usize,
    refine: Option<Refinement>,
}

impl SetPoolingHead {
    /// Create a pooling head for elements of width `in_features`.
    pub fn new(in_features: usize, config: &PoolingConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let refine = match &config.refine {
            Some(rc) => {
                let hidden = RowWiseMlp::single(in_features, rc.hidden, rc.activation, vb.pp("hidden"))?;
                let project = RowWiseMlp::single(rc.hidden, rc.out, Activation::Identity, vb.pp("final"))?;
                Some(Refinement {
                    dropout: Dropout::new(rc.dropout),
                    hidden,
                    project,
                })
            }
            None => None,
        };

        debug!(
            in_features,
            refine = refine.is_some(),
            "built set pooling head"
        );
        Ok(Self {
            in_features,
            refine,
        })
    }

    /// Width of the set-level representation.
    pub fn out_features(&self) -> usize {
        match &self.refine {
            Some(r) => r.project.out_features(),
            None => self.in_features,
        }
    }

    pub fn is_refined(&self) -> bool {
        self.refine.is_some()
    }

    /// Inference-mode forward pass: (B x N x F) -> (B x F').
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }

    /// Forward pass; dropout is active only when `train` is set.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let pooled = max_pool(x)?;
        let Some(r) = &self.refine else {
            return Ok(pooled);
        };
        let h = r.dropout.forward(&pooled, train)?;
        let h = r.hidden.forward(&h)?;
        let h = r.dropout.forward(&h, train)?;
        r.project.forward(&h)
    }
}
