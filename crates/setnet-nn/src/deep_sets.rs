//! DeepSets: permutation-equivariant encoder stack.
//!
//! Each [`EquivariantBlock`] centres every element on a per-set summary and
//! then applies a shared row-wise layer:
//!
//! ```text
//! y_i = σ(W (x_i - max_j x_j) + b)
//! ```
//!
//! The summary is computed per set and per feature, and it is the same for
//! every element of a set. Permuting the input permutes the output row for
//! row.
//!
//! [`DeepSetsModel`] stacks three blocks and max-pools the result into a
//! single set-level vector.
//!
//! # Reference
//!
//! Zaheer et al., "Deep Sets", NeurIPS 2017.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::pooling::{PoolingConfig, SetPoolingHead};
use crate::row_wise::RowWiseMlp;
use crate::set::{expect_width, SET_AXIS};
use crate::SetEncoder;

/// Number of equivariant blocks in a [`DeepSetsModel`].
pub const DEEP_SETS_BLOCKS: usize = 3;

/// Per-set summary subtracted from every element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Element-wise maximum over the set.
    #[default]
    Max,
    /// Element-wise mean over the set.
    Mean,
    /// Element-wise sum over the set.
    Sum,
}

impl Reduction {
    /// Reduce over the set axis, keeping it as size 1 for broadcasting.
    pub fn reduce_keepdim(&self, x: &Tensor) -> Result<Tensor> {
        let summary = match self {
            Reduction::Max => x.max_keepdim(SET_AXIS)?,
            Reduction::Mean => x.mean_keepdim(SET_AXIS)?,
            Reduction::Sum => x.sum_keepdim(SET_AXIS)?,
        };
        Ok(summary)
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reduction::Max => "max",
            Reduction::Mean => "mean",
            Reduction::Sum => "sum",
        })
    }
}

impl FromStr for Reduction {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(Reduction::Max),
            "mean" => Ok(Reduction::Mean),
            "sum" => Ok(Reduction::Sum),
            other => Err(Error::InvalidConfig(format!("unknown reduction: {other:?}"))),
        }
    }
}

/// One centre-then-transform stage.
#[derive(Debug, Clone)]
pub struct EquivariantBlock {
    reduction: Reduction,
    transform: RowWiseMlp,
}

impl EquivariantBlock {
    /// Create an equivariant block.
    ///
    /// # Arguments
    /// - `in_features`: element width
    /// - `out_features`: width after the row-wise layer
    /// - `activation`: nonlinearity of the row-wise layer
    /// - `reduction`: per-set summary used for centring
    /// - `vb`: variable builder owning this block's parameters
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        reduction: Reduction,
        vb: VarBuilder,
    ) -> Result<Self> {
        let transform = RowWiseMlp::single(in_features, out_features, activation, vb)?;
        Ok(Self {
            reduction,
            transform,
        })
    }

    pub fn in_features(&self) -> usize {
        self.transform.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.transform.out_features()
    }

    /// Forward pass: (B x N x in_features) -> (B x N x out_features).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        expect_width(x, self.in_features())?;
        let summary = self.reduction.reduce_keepdim(x)?; // (B, 1, F)
        let centred = x.broadcast_sub(&summary)?;
        self.transform.forward(&centred)
    }
}

/// DeepSets model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepSetsConfig {
    /// Output width of each equivariant block (default: 256 for all three).
    pub widths: [usize; DEEP_SETS_BLOCKS],
    /// Activation of each block (default: tanh).
    pub activation: Activation,
    /// Centring summary (default: max).
    pub reduction: Reduction,
    /// Pooling head (default: pool only).
    pub pooling: PoolingConfig,
}

impl Default for DeepSetsConfig {
    fn default() -> Self {
        Self {
            widths: [256; DEEP_SETS_BLOCKS],
            activation: Activation::Tanh,
            reduction: Reduction::Max,
            pooling: PoolingConfig::default(),
        }
    }
}

impl DeepSetsConfig {
    /// Use the same width for every block.
    pub fn with_width(mut self, width: usize) -> Self {
        self.widths = [width; DEEP_SETS_BLOCKS];
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_pooling(mut self, pooling: PoolingConfig) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.widths.contains(&0) {
            return Err(Error::InvalidConfig("DeepSets block widths must be > 0".into()));
        }
        self.pooling.validate()
    }
}

/// Three equivariant blocks followed by a set pooling head.
#[derive(Debug, Clone)]
pub struct DeepSetsModel {
    blocks: Vec<EquivariantBlock>,
    head: SetPoolingHead,
}

impl DeepSetsModel {
    /// Build a DeepSets model for elements of width `in_features`.
    ///
    /// Block `i` (1-based) owns the parameters under `permequiv{i}`; the
    /// pooling head owns `head`.
    pub fn new(config: &DeepSetsConfig, in_features: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let mut blocks = Vec::with_capacity(DEEP_SETS_BLOCKS);
        let mut width = in_features;
        for (i, &out) in config.widths.iter().enumerate() {
            let block = EquivariantBlock::new(
                width,
                out,
                config.activation,
                config.reduction,
                vb.pp(format!("permequiv{}", i + 1)),
            )?;
            blocks.push(block);
            width = out;
        }
        let head = SetPoolingHead::new(width, &config.pooling, vb.pp("head"))?;

        debug!(
            in_features,
            widths = ?config.widths,
            activation = %config.activation,
            reduction = %config.reduction,
            out_features = head.out_features(),
            "built DeepSets model"
        );
        Ok(Self { blocks, head })
    }

    pub fn blocks(&self) -> &[EquivariantBlock] {
        &self.blocks
    }

    pub fn head(&self) -> &SetPoolingHead {
        &self.head
    }

    /// Per-element features after the equivariant stack: (B x N x F_last).
    pub fn encode_elements(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(h)
    }

    /// Inference-mode forward pass: (B x N x F) -> (B x F'').
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_t(x, false)
    }

    /// Forward pass; `train` only affects the refinement dropout.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.encode_elements(x)?;
        self.head.forward_t(&h, train)
    }
}

impl SetEncoder for DeepSetsModel {
    fn input_dim(&self) -> usize {
        self.blocks[0].in_features()
    }

    fn output_dim(&self) -> usize {
        self.head.out_features()
    }

    fn encode(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_t(x, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn reference_batch(device: &Device) -> Tensor {
        Tensor::new(
            &[
                [[1f32, 2., 3.], [4., 5., 6.], [12., 65., 78.], [0., 65., 78.]],
                [[7., 8., 9.], [3., 1., 7.], [12., 65., 78.], [12., 1003., 78.]],
            ],
            device,
        )
        .unwrap()
    }

    #[test]
    fn test_block_centres_on_set_max() {
        let device = Device::Cpu;
        // Zero weights and identity activation would hide the centring, so
        // check the summary directly.
        let x = Tensor::new(&[[[1f32, 5.], [3., 2.]]], &device).unwrap();
        let summary = Reduction::Max.reduce_keepdim(&x).unwrap();
        assert_eq!(summary.dims(), &[1, 1, 2]);
        let centred = x.broadcast_sub(&summary).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(centred, vec![vec![vec![-2., 0.], vec![0., -3.]]]);
    }

    #[test]
    fn test_block_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = EquivariantBlock::new(3, 6, Activation::Tanh, Reduction::Max, vb).unwrap();

        let out = block.forward(&reference_batch(&device)).unwrap();
        assert_eq!(out.dims(), &[2, 4, 6]);
    }

    #[test]
    fn test_block_translation_invariant_under_max() {
        // x - max(x) is unchanged by adding a constant to every element.
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = EquivariantBlock::new(3, 5, Activation::Tanh, Reduction::Max, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 4, 3), &device).unwrap();
        let shifted = (&x + 10.0).unwrap();
        let a = block.forward(&x).unwrap().to_vec3::<f32>().unwrap();
        let b = block.forward(&shifted).unwrap().to_vec3::<f32>().unwrap();
        for (sa, sb) in a.iter().zip(b.iter()) {
            for (ra, rb) in sa.iter().zip(sb.iter()) {
                for (va, vb) in ra.iter().zip(rb.iter()) {
                    assert!((va - vb).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_reference_driver_shape_and_swap() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = DeepSetsModel::new(&DeepSetsConfig::default().with_width(6), 3, vb).unwrap();

        let x = reference_batch(&device);
        let out = model.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 6]);

        // Swap elements 3 and 4 of the first set.
        let swapped = Tensor::new(
            &[
                [[1f32, 2., 3.], [4., 5., 6.], [0., 65., 78.], [12., 65., 78.]],
                [[7., 8., 9.], [3., 1., 7.], [12., 65., 78.], [12., 1003., 78.]],
            ],
            &device,
        )
        .unwrap();
        let out_swapped = model.forward(&swapped).unwrap();

        let a = out.to_vec2::<f32>().unwrap();
        let b = out_swapped.to_vec2::<f32>().unwrap();
        for (ra, rb) in a.iter().zip(b.iter()) {
            for (va, vb) in ra.iter().zip(rb.iter()) {
                assert!((va - vb).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_output_independent_of_set_size() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = DeepSetsModel::new(&DeepSetsConfig::default().with_width(8), 3, vb).unwrap();
        assert_eq!(model.output_dim(), 8);

        for n in [1, 2, 7] {
            let x = Tensor::randn(0f32, 1f32, (3, n, 3), &device).unwrap();
            assert_eq!(model.forward(&x).unwrap().dims(), &[3, 8]);
        }
    }

    #[test]
    fn test_wrong_width_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = DeepSetsModel::new(&DeepSetsConfig::default().with_width(4), 3, vb).unwrap();

        let x = Tensor::zeros((1, 2, 5), DType::F32, &device).unwrap();
        assert!(matches!(
            model.forward(&x),
            Err(Error::DimensionMismatch { expected: 3, got: 5 })
        ));
    }

    #[test]
    fn test_parameters_scoped_per_block() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        DeepSetsModel::new(&DeepSetsConfig::default().with_width(4), 3, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for i in 1..=3 {
            assert!(data.contains_key(&format!("permequiv{i}.layer_0.weight")));
            assert!(data.contains_key(&format!("permequiv{i}.layer_0.bias")));
        }
        assert_eq!(data.len(), 6);
    }
}
