//! Message passing over a learned kernel graph.
//!
//! One round diffuses element features through a fixed kernel matrix and then
//! applies a shared row-wise layer. Three round kinds exist:
//!
//! ```text
//! plain:      h' = σ(W d + b)                      d = pool(K, h)
//! denoising:  h' = [σ(W g + b) || h]               g = α h + (1 - α) d
//! residual:   h' = σ(W d + b) + d
//! ```
//!
//! `pool` is an approximate max by default (see [`PoolOp`]). The gate `α` is
//! one learned scalar per denoising round. It is not clamped, and
//! [`MessagePassingBlock::gate`] exposes its current value.
//!
//! Rounds never modify `K`. A model builds it once and passes the same
//! tensor to every round.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::kernel::{pool_on_kernel, PoolOp};
use crate::row_wise::RowWiseMlp;
use crate::set::expect_width;

/// Update rule of a message-passing round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BlockKind {
    /// Diffuse, then transform.
    Plain,
    /// Gate the diffusion against the input, transform, and carry the input
    /// alongside the transformed features.
    Denoising,
    /// Diffuse, transform, and add the diffused features back.
    Residual,
}

impl BlockKind {
    /// Default round sequence: three denoising rounds.
    ///
    /// Returns a new vector on every call.
    pub fn default_sequence() -> Vec<BlockKind> {
        vec![BlockKind::Denoising; 3]
    }

    /// Parse a comma-separated list such as `"plain,denoising,residual"`.
    ///
    /// Empty tokens are skipped, so an empty string yields an empty sequence.
    /// A lone `""` tag in a config list still means [`BlockKind::Plain`].
    pub fn parse_sequence(s: &str) -> Result<Vec<BlockKind>> {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Plain => "plain",
            BlockKind::Denoising => "denoising",
            BlockKind::Residual => "residual",
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "dmps" | "" => Ok(BlockKind::Plain),
            "denoising" | "denoise" | "denoising_block" => Ok(BlockKind::Denoising),
            "residual" | "residual_block" => Ok(BlockKind::Residual),
            _ => Err(Error::UnknownBlockKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for BlockKind {
    type Error = Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BlockKind> for String {
    fn from(kind: BlockKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Settings shared by every round of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Width of the row-wise layer (default: 256).
    pub width: usize,
    /// Activation of the row-wise layer (default: relu).
    pub activation: Activation,
    /// Neighbor reduction (default: approx_max).
    pub pool_op: PoolOp,
    /// Initial value of the denoising gate α (default: 0.5).
    pub gate_init: f64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            width: 256,
            activation: Activation::Relu,
            pool_op: PoolOp::ApproxMax,
            gate_init: 0.5,
        }
    }
}

impl RoundConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(Error::InvalidConfig("round width must be > 0".into()));
        }
        if !self.gate_init.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "gate_init must be finite, got {}",
                self.gate_init
            )));
        }
        Ok(())
    }
}

/// One round of diffusion over a fixed kernel.
#[derive(Debug, Clone)]
pub struct MessagePassingBlock {
    kind: BlockKind,
    round: usize,
    in_features: usize,
    pool_op: PoolOp,
    transform: RowWiseMlp,
    /// Diffusion gate α, shape (1,); present only for denoising rounds.
    gate: Option<Tensor>,
}

impl MessagePassingBlock {
    /// Create a round.
    ///
    /// # Arguments
    /// - `round`: position in the model's round sequence (used for logging)
    /// - `kind`: update rule
    /// - `in_features`: element width entering the round
    /// - `config`: shared round settings
    /// - `vb`: variable builder owning this round's parameters
    ///
    /// Residual rounds add the diffused input to the transformed output, so
    /// they require `config.width == in_features`.
    pub fn new(
        round: usize,
        kind: BlockKind,
        in_features: usize,
        config: &RoundConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        if kind == BlockKind::Residual && config.width != in_features {
            return Err(Error::DimensionMismatch {
                expected: in_features,
                got: config.width,
            });
        }

        let transform = RowWiseMlp::single(
            in_features,
            config.width,
            config.activation,
            vb.pp("linear_layer"),
        )?;
        let gate = match kind {
            BlockKind::Denoising => Some(vb.get_with_hints(
                1usize,
                "diffusion_constant",
                Init::Const(config.gate_init),
            )?),
            _ => None,
        };

        debug!(
            round,
            kind = %kind,
            in_features,
            width = config.width,
            pool_op = %config.pool_op,
            "built message passing block"
        );
        Ok(Self {
            kind,
            round,
            in_features,
            pool_op: config.pool_op,
            transform,
            gate,
        })
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Width of the round's output.
    ///
    /// Denoising rounds carry their input alongside the transformed
    /// features, so their output is `width + in_features` wide.
    pub fn output_dim(&self) -> usize {
        match self.kind {
            BlockKind::Denoising => self.transform.out_features() + self.in_features,
            BlockKind::Plain | BlockKind::Residual => self.transform.out_features(),
        }
    }

    /// The gate parameter tensor, for denoising rounds.
    pub fn gate_tensor(&self) -> Option<&Tensor> {
        self.gate.as_ref()
    }

    /// Current value of the gate α, for denoising rounds.
    pub fn gate(&self) -> Result<Option<f64>> {
        match &self.gate {
            Some(alpha) => {
                let v = alpha.to_dtype(DType::F64)?.to_vec1::<f64>()?;
                Ok(v.first().copied())
            }
            None => Ok(None),
        }
    }

    /// Pre-transform signal: diffusion over `adj`, gated for denoising rounds.
    ///
    /// # Arguments
    /// - `x`: element features (B x N x in_features)
    /// - `adj`: kernel matrices (B x N x N)
    pub fn diffuse(&self, x: &Tensor, adj: &Tensor) -> Result<Tensor> {
        expect_width(x, self.in_features)?;
        let diffused = pool_on_kernel(adj, x, self.pool_op)?;
        match &self.gate {
            Some(alpha) => {
                let keep = x.broadcast_mul(alpha)?;
                let adopt = diffused.broadcast_mul(&alpha.affine(-1.0, 1.0)?)?;
                Ok((keep + adopt)?)
            }
            None => Ok(diffused),
        }
    }

    /// Forward pass: (B x N x in_features) -> (B x N x output_dim).
    pub fn forward(&self, x: &Tensor, adj: &Tensor) -> Result<Tensor> {
        let d = self.diffuse(x, adj)?;
        let out = match self.kind {
            BlockKind::Plain => self.transform.forward(&d)?,
            BlockKind::Denoising => self.transform.forward_with_supplement(&d, x)?,
            BlockKind::Residual => (self.transform.forward(&d)? + &d)?,
        };
        trace!(round = self.round, kind = %self.kind, dims = ?out.dims(), "message passing round");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_config(width: usize) -> RoundConfig {
        RoundConfig {
            width,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_block_kinds() {
        assert_eq!("plain".parse::<BlockKind>().unwrap(), BlockKind::Plain);
        assert_eq!("denoising_block".parse::<BlockKind>().unwrap(), BlockKind::Denoising);
        assert_eq!("Residual".parse::<BlockKind>().unwrap(), BlockKind::Residual);

        assert_eq!("".parse::<BlockKind>().unwrap(), BlockKind::Plain);

        match "highway".parse::<BlockKind>() {
            Err(Error::UnknownBlockKind(tag)) => assert_eq!(tag, "highway"),
            other => panic!("expected UnknownBlockKind, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_sequence() {
        let seq = BlockKind::parse_sequence("plain, denoising,residual").unwrap();
        assert_eq!(seq, vec![BlockKind::Plain, BlockKind::Denoising, BlockKind::Residual]);
        assert!(BlockKind::parse_sequence("").unwrap().is_empty());
        assert!(BlockKind::parse_sequence("plain,bogus").is_err());
    }

    #[test]
    fn test_default_sequence_is_fresh() {
        let mut a = BlockKind::default_sequence();
        a.push(BlockKind::Plain);
        assert_eq!(BlockKind::default_sequence().len(), 3);
    }

    #[test]
    fn test_plain_preserves_set_axis() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = MessagePassingBlock::new(0, BlockKind::Plain, 4, &small_config(6), vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 5, 4), &device).unwrap();
        let adj = Tensor::rand(0f32, 1f32, (2, 5, 5), &device).unwrap();
        let out = block.forward(&x, &adj).unwrap();
        assert_eq!(out.dims(), &[2, 5, 6]);
        assert_eq!(block.output_dim(), 6);
        assert!(block.gate().unwrap().is_none());
        assert!(block.gate_tensor().is_none());
    }

    #[test]
    fn test_denoising_gate_one_keeps_input() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = RoundConfig {
            width: 3,
            gate_init: 1.0,
            ..Default::default()
        };
        let block = MessagePassingBlock::new(0, BlockKind::Denoising, 2, &config, vb).unwrap();
        assert_eq!(block.gate().unwrap(), Some(1.0));

        let x = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let adj = Tensor::new(&[[[0.3f32, 0.9], [0.2, 0.7]]], &device).unwrap();
        let d = block.diffuse(&x, &adj).unwrap();
        assert_eq!(d.to_vec3::<f32>().unwrap(), vec![vec![vec![1., 2.], vec![3., 4.]]]);
    }

    #[test]
    fn test_denoising_gate_zero_is_pure_diffusion() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = RoundConfig {
            width: 3,
            gate_init: 0.0,
            ..Default::default()
        };
        let block = MessagePassingBlock::new(0, BlockKind::Denoising, 2, &config, vb).unwrap();

        let x = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let adj = Tensor::new(&[[[0.3f32, 0.9], [0.2, 0.7]]], &device).unwrap();
        let gated = block.diffuse(&x, &adj).unwrap().to_vec3::<f32>().unwrap();
        let raw = pool_on_kernel(&adj, &x, PoolOp::ApproxMax)
            .unwrap()
            .to_vec3::<f32>()
            .unwrap();
        assert_eq!(gated, raw);
    }

    #[test]
    fn test_denoising_appends_input() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let config = RoundConfig {
            width: 3,
            activation: Activation::Identity,
            ..Default::default()
        };
        let block = MessagePassingBlock::new(1, BlockKind::Denoising, 2, &config, vb).unwrap();
        assert_eq!(block.output_dim(), 5);

        let x = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let adj = Tensor::ones((1, 2, 2), DType::F32, &device).unwrap();
        let out = block.forward(&x, &adj).unwrap().to_vec3::<f32>().unwrap();
        // Zero weights zero the transformed part; the input rides along unchanged.
        assert_eq!(out[0][0], vec![0., 0., 0., 1., 2.]);
        assert_eq!(out[0][1], vec![0., 0., 0., 3., 4.]);
    }

    #[test]
    fn test_residual_skip_path() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let config = RoundConfig {
            width: 3,
            activation: Activation::Identity,
            ..Default::default()
        };
        let block = MessagePassingBlock::new(0, BlockKind::Residual, 3, &config, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 4, 3), &device).unwrap();
        let adj = Tensor::rand(0f32, 1f32, (2, 4, 4), &device).unwrap();
        let out = block.forward(&x, &adj).unwrap().to_vec3::<f32>().unwrap();
        let diffused = block.diffuse(&x, &adj).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(out, diffused);
    }

    #[test]
    fn test_residual_width_must_match() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        assert!(matches!(
            MessagePassingBlock::new(0, BlockKind::Residual, 4, &small_config(6), vb),
            Err(Error::DimensionMismatch { expected: 4, got: 6 })
        ));
    }

    #[test]
    fn test_gate_is_scoped_parameter() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = MessagePassingBlock::new(
            2,
            BlockKind::Denoising,
            4,
            &small_config(4),
            vb.pp("message_passing_2"),
        )
        .unwrap();

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("message_passing_2.diffusion_constant"));
        assert!(data.contains_key("message_passing_2.linear_layer.layer_0.weight"));

        // The block reads the stored variable, not a copy of it.
        let gate = block.gate_tensor().unwrap();
        assert_eq!(gate.dims(), &[1]);
        let stored = data["message_passing_2.diffusion_constant"].as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(gate.to_vec1::<f32>().unwrap(), stored);
    }
}
