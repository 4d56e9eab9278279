//! Row-wise feed-forward transforms.
//!
//! A row-wise transform applies the same MLP to every element of a set:
//!
//! ```text
//! y[b, i, :] = act_L(... act_1(x[b, i, :] W_1 + b_1) ... W_L + b_L)
//! ```
//!
//! The weights are shared across all `N` element positions and all `B` sets,
//! so permuting the elements of a set permutes the output rows identically.
//! This is the only parametrized operation the set encoders apply per element.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{Error, Result};

/// One dense layer of a row-wise MLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Output width of the layer.
    pub nodes: usize,
    /// Nonlinearity applied after the affine map.
    #[serde(default)]
    pub activation: Activation,
}

impl LayerSpec {
    pub fn new(nodes: usize, activation: Activation) -> Self {
        Self { nodes, activation }
    }

    /// Build one spec per width, all with the same activation.
    pub fn uniform(widths: &[usize], activation: Activation) -> Vec<Self> {
        widths.iter().map(|&n| Self::new(n, activation)).collect()
    }
}

/// Shared-parameter MLP applied independently to every set element.
#[derive(Debug, Clone)]
pub struct RowWiseMlp {
    layers: Vec<(Linear, Activation)>,
    in_features: usize,
    out_features: usize,
}

impl RowWiseMlp {
    /// Create a row-wise MLP.
    ///
    /// # Arguments
    /// - `in_features`: width of each input element
    /// - `specs`: one entry per dense layer, applied in order
    /// - `vb`: variable builder; layer `i` lives under `layer_{i}`
    pub fn new(in_features: usize, specs: &[LayerSpec], vb: VarBuilder) -> Result<Self> {
        if in_features == 0 {
            return Err(Error::InvalidConfig("row-wise input width must be > 0".into()));
        }
        if specs.is_empty() {
            return Err(Error::InvalidConfig("row-wise MLP needs at least one layer".into()));
        }

        let mut layers = Vec::with_capacity(specs.len());
        let mut width = in_features;
        for (i, spec) in specs.iter().enumerate() {
            if spec.nodes == 0 {
                return Err(Error::InvalidConfig(format!("layer {i} has zero nodes")));
            }
            let lin = linear(width, spec.nodes, vb.pp(format!("layer_{i}")))?;
            layers.push((lin, spec.activation));
            width = spec.nodes;
        }

        Ok(Self {
            layers,
            in_features,
            out_features: width,
        })
    }

    /// Single-layer convenience constructor.
    pub fn single(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        Self::new(in_features, &[LayerSpec::new(out_features, activation)], vb)
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `x`: (..., in_features), typically a set batch (B, N, in_features)
    ///
    /// # Returns
    /// - (..., out_features), leading axes untouched
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if x.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: x.rank(),
            });
        }
        let got = x.dim(D::Minus1)?;
        if got != self.in_features {
            return Err(Error::DimensionMismatch {
                expected: self.in_features,
                got,
            });
        }

        let mut h = x.clone();
        for (lin, act) in &self.layers {
            h = act.apply(&lin.forward(&h)?)?;
        }
        Ok(h)
    }

    /// Forward pass with an identity-mapped supplement.
    ///
    /// The supplement is concatenated, unmodified, onto the transformed
    /// features along the last axis: `[mlp(x) || supplement]`.
    pub fn forward_with_supplement(&self, x: &Tensor, supplement: &Tensor) -> Result<Tensor> {
        let h = self.forward(x)?;
        let (h_dims, s_dims) = (h.dims(), supplement.dims());
        if h_dims.len() != s_dims.len() {
            return Err(Error::RankMismatch {
                expected: h_dims.len(),
                got: s_dims.len(),
            });
        }
        let lead = h_dims.len() - 1;
        for axis in 0..lead {
            if h_dims[axis] != s_dims[axis] {
                return Err(Error::DimensionMismatch {
                    expected: h_dims[axis],
                    got: s_dims[axis],
                });
            }
        }
        Ok(Tensor::cat(&[&h, supplement], lead)?)
    }
}
