//! Learned kernel graphs over set elements.
//!
//! DMPS does not receive a graph. It learns one. Each element is embedded by a
//! row-wise MLP `φ`, and the pairwise affinity is a Gaussian kernel on the
//! embeddings:
//!
//! ```text
//! K[b, i, j] = exp(-γ ||φ(x_bi) - φ(x_bj)||²)
//! ```
//!
//! Permuting the elements permutes the rows and columns of `K` together, so
//! any diffusion over `K` stays equivariant.
//!
//! [`pool_on_kernel`] then aggregates neighbor features through `K` with one
//! of the [`PoolOp`] reductions.

use std::fmt;
use std::str::FromStr;

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::row_wise::{LayerSpec, RowWiseMlp};
use crate::set::set_batch_dims;

/// Reduction used to aggregate neighbor contributions over a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolOp {
    /// Hard maximum of `K_ij * x_j` over neighbors `j`.
    Max,
    /// Softmax-weighted maximum of `K_ij * x_j`; differentiable in every
    /// contribution, not just the winning one.
    #[default]
    ApproxMax,
    /// Weighted sum `K · X` (the GCN aggregation).
    Sum,
}

impl fmt::Display for PoolOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolOp::Max => "max",
            PoolOp::ApproxMax => "approx_max",
            PoolOp::Sum => "sum",
        })
    }
}

impl FromStr for PoolOp {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(PoolOp::Max),
            "approx_max" | "approx-max" | "soft_max" => Ok(PoolOp::ApproxMax),
            "sum" => Ok(PoolOp::Sum),
            other => Err(Error::InvalidConfig(format!("unknown pool op: {other:?}"))),
        }
    }
}

/// Aggregate element features over a kernel.
///
/// # Arguments
/// - `adj`: kernel matrices (B x N x N)
/// - `x`: element features (B x N x F)
/// - `op`: neighbor reduction
///
/// # Returns
/// - Aggregated features (B x N x F); row `i` pools over `K[:, i, :]`
pub fn pool_on_kernel(adj: &Tensor, x: &Tensor, op: PoolOp) -> Result<Tensor> {
    let (b, n, _f) = set_batch_dims(x)?;
    if adj.rank() != 3 {
        return Err(Error::RankMismatch {
            expected: 3,
            got: adj.rank(),
        });
    }
    let (ab, an, am) = adj.dims3()?;
    if ab != b {
        return Err(Error::DimensionMismatch { expected: b, got: ab });
    }
    if an != n || am != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            got: if an != n { an } else { am },
        });
    }

    match op {
        PoolOp::Sum => Ok(adj.matmul(x)?),
        PoolOp::Max | PoolOp::ApproxMax => {
            // messages[b, i, j, :] = K[b, i, j] * x[b, j, :]
            let messages = adj.unsqueeze(3)?.broadcast_mul(&x.unsqueeze(1)?)?;
            if op == PoolOp::Max {
                Ok(messages.max(2)?)
            } else {
                let weights = candle_nn::ops::softmax(&messages, 2)?;
                Ok((weights * messages)?.sum(2)?)
            }
        }
    }
}

/// Kernel construction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Widths of the embedding MLP `φ` (default: [256, 512]).
    pub hidden_sizes: Vec<usize>,
    /// Activation of every embedding layer (default: tanh).
    pub activation: Activation,
    /// Divide each row by its sum (default: false).
    pub row_norm: bool,
    /// Divide each matrix by its mean entry (default: false).
    pub mean_norm: bool,
    /// Kernel bandwidth γ; `None` uses 1 / embedding width.
    pub gamma: Option<f64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![256, 512],
            activation: Activation::Tanh,
            row_norm: false,
            mean_norm: false,
            gamma: None,
        }
    }
}

impl KernelConfig {
    pub fn with_hidden_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.hidden_sizes = sizes;
        self
    }

    pub fn with_norms(mut self, row_norm: bool, mean_norm: bool) -> Self {
        self.row_norm = row_norm;
        self.mean_norm = mean_norm;
        self
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = Some(gamma);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_sizes.is_empty() || self.hidden_sizes.contains(&0) {
            return Err(Error::InvalidConfig(
                "kernel hidden sizes must be non-empty and positive".into(),
            ));
        }
        if let Some(g) = self.gamma {
            if !(g.is_finite() && g > 0.0) {
                return Err(Error::InvalidConfig(format!("kernel gamma must be > 0, got {g}")));
            }
        }
        Ok(())
    }
}

/// Learned Gaussian kernel over row-wise embeddings.
#[derive(Debug, Clone)]
pub struct DeepKernel {
    embed: RowWiseMlp,
    gamma: f64,
    row_norm: bool,
    mean_norm: bool,
}

impl DeepKernel {
    /// Create a kernel builder for elements of width `in_features`.
    pub fn new(in_features: usize, config: &KernelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let specs = LayerSpec::uniform(&config.hidden_sizes, config.activation);
        let embed = RowWiseMlp::new(in_features, &specs, vb.pp("embed"))?;
        let gamma = config
            .gamma
            .unwrap_or(1.0 / embed.out_features() as f64);

        debug!(
            in_features,
            embed_dim = embed.out_features(),
            gamma,
            row_norm = config.row_norm,
            mean_norm = config.mean_norm,
            "built deep kernel"
        );

        Ok(Self {
            embed,
            gamma,
            row_norm: config.row_norm,
            mean_norm: config.mean_norm,
        })
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Build one kernel matrix per set, using the configured normalization.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        self.build_kernel_matrix(features, self.row_norm, self.mean_norm)
    }

    /// Build one kernel matrix per set.
    ///
    /// # Arguments
    /// - `features`: element features (B x N x F)
    /// - `row_norm`: make every row sum to one
    /// - `mean_norm`: divide each matrix by its mean entry
    ///
    /// # Returns
    /// - Kernel matrices (B x N x N), symmetric with a unit diagonal before
    ///   normalization
    pub fn build_kernel_matrix(
        &self,
        features: &Tensor,
        row_norm: bool,
        mean_norm: bool,
    ) -> Result<Tensor> {
        set_batch_dims(features)?;
        let phi = self.embed.forward(features)?.contiguous()?;

        // ||a - b||² = ||a||² + ||b||² - 2 a·b
        let sq_norms = phi.sqr()?.sum_keepdim(D::Minus1)?; // (B, N, 1)
        let gram = phi.matmul(&phi.t()?.contiguous()?)?; // (B, N, N)
        let sq_dist = sq_norms
            .broadcast_add(&sq_norms.t()?)?
            .sub(&(gram * 2.0)?)?
            .relu()?; // clamp rounding below zero
        let mut k = (sq_dist * (-self.gamma))?.exp()?;

        if row_norm {
            let row_sum = (k.sum_keepdim(2)? + 1e-12)?;
            k = k.broadcast_div(&row_sum)?;
        }
        if mean_norm {
            let mean = (k.mean_keepdim(2)?.mean_keepdim(1)? + 1e-12)?;
            k = k.broadcast_div(&mean)?;
        }
        Ok(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_kernel(vb: VarBuilder) -> DeepKernel {
        let config = KernelConfig::default().with_hidden_sizes(vec![8, 4]);
        DeepKernel::new(3, &config, vb).unwrap()
    }

    #[test]
    fn test_kernel_shape_and_symmetry() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let kernel = small_kernel(vb);

        let x = Tensor::randn(0f32, 1f32, (2, 5, 3), &device).unwrap();
        let k = kernel.forward(&x).unwrap();
        assert_eq!(k.dims(), &[2, 5, 5]);

        let kv = k.to_vec3::<f32>().unwrap();
        for batch in &kv {
            for i in 0..5 {
                assert!((batch[i][i] - 1.0).abs() < 1e-4, "diagonal should be ~1");
                for j in 0..5 {
                    assert!((batch[i][j] - batch[j][i]).abs() < 1e-5);
                    assert!(batch[i][j] > 0.0 && batch[i][j] <= 1.0 + 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_gamma_defaults_to_inverse_embed_width() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let kernel = small_kernel(vb.clone());
        assert_eq!(kernel.gamma(), 0.25);

        let config = KernelConfig::default().with_hidden_sizes(vec![8, 4]).with_gamma(2.0);
        let kernel = DeepKernel::new(3, &config, vb).unwrap();
        assert_eq!(kernel.gamma(), 2.0);
        assert!(KernelConfig::default().with_gamma(0.0).validate().is_err());
    }

    #[test]
    fn test_row_norm_rows_sum_to_one() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let kernel = small_kernel(vb);

        let x = Tensor::randn(0f32, 1f32, (1, 4, 3), &device).unwrap();
        let k = kernel.build_kernel_matrix(&x, true, false).unwrap();
        let sums = k.sum(2).unwrap().to_vec2::<f32>().unwrap();
        for s in &sums[0] {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mean_norm_has_unit_mean() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let kernel = small_kernel(vb);

        let x = Tensor::randn(0f32, 1f32, (1, 4, 3), &device).unwrap();
        let k = kernel.build_kernel_matrix(&x, false, true).unwrap();
        let mean: f32 = k.mean_all().unwrap().to_scalar().unwrap();
        assert!((mean - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_pool_max_and_sum() {
        let device = Device::Cpu;
        // One set, two elements; element 0 sees only itself, element 1 sees both.
        let adj = Tensor::new(&[[[1f32, 0.], [1., 1.]]], &device).unwrap();
        let x = Tensor::new(&[[[1f32, 5.], [3., 2.]]], &device).unwrap();

        let max = pool_on_kernel(&adj, &x, PoolOp::Max).unwrap();
        assert_eq!(max.to_vec3::<f32>().unwrap(), vec![vec![vec![1., 5.], vec![3., 5.]]]);

        let sum = pool_on_kernel(&adj, &x, PoolOp::Sum).unwrap();
        assert_eq!(sum.to_vec3::<f32>().unwrap(), vec![vec![vec![1., 5.], vec![4., 7.]]]);
    }

    #[test]
    fn test_approx_max_bounded_by_max() {
        let device = Device::Cpu;
        let adj = Tensor::rand(0f32, 1f32, (2, 4, 4), &device).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 4, 6), &device).unwrap();

        let hard = pool_on_kernel(&adj, &x, PoolOp::Max).unwrap();
        let soft = pool_on_kernel(&adj, &x, PoolOp::ApproxMax).unwrap();
        assert_eq!(soft.dims(), &[2, 4, 6]);

        let gap = (hard - soft).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(gap.iter().all(|g| *g >= -1e-5), "soft max must not exceed hard max");
    }

    #[test]
    fn test_pool_rejects_mismatched_adjacency() {
        let device = Device::Cpu;
        let adj = Tensor::zeros((1, 3, 3), DType::F32, &device).unwrap();
        let x = Tensor::zeros((1, 4, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            pool_on_kernel(&adj, &x, PoolOp::ApproxMax),
            Err(Error::DimensionMismatch { expected: 4, got: 3 })
        ));
    }
}
