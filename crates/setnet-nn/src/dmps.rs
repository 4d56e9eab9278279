//! Deep message passing on sets (DMPS).
//!
//! A set has no edges, so DMPS learns them:
//!
//! 1. **Extract**: one row-wise layer embeds each element.
//! 2. **Graph**: a [`DeepKernel`] turns the embeddings into a soft adjacency
//!    `K` (B x N x N). It is built once per forward pass.
//! 3. **Diffuse**: each configured [`MessagePassingBlock`] runs in order.
//!    Every round reads the previous round's features and the same `K`.
//! 4. **Pool**: an element-wise max over the set axis.
//!
//! With an empty round sequence, step 3 is skipped and the model is
//! extraction followed by max-pooling.
//!
//! # Reference
//!
//! Shi et al., "Deep Message Passing on Sets", AAAI 2020.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::kernel::{DeepKernel, KernelConfig};
use crate::message_passing::{BlockKind, MessagePassingBlock, RoundConfig};
use crate::row_wise::RowWiseMlp;
use crate::set::{expect_width, max_pool};
use crate::SetEncoder;

/// DMPS model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmpsConfig {
    /// One entry per round, run in order (default: three denoising rounds).
    pub blocks: Vec<BlockKind>,
    /// Width of the feature extraction layer (default: 256).
    pub extraction_width: usize,
    /// Activation of the feature extraction layer (default: relu).
    pub extraction_activation: Activation,
    /// Settings shared by every round.
    pub rounds: RoundConfig,
    /// Kernel graph construction.
    pub kernel: KernelConfig,
}

impl Default for DmpsConfig {
    fn default() -> Self {
        Self {
            blocks: BlockKind::default_sequence(),
            extraction_width: 256,
            extraction_activation: Activation::Relu,
            rounds: RoundConfig::default(),
            kernel: KernelConfig::default(),
        }
    }
}

impl DmpsConfig {
    pub fn with_blocks(mut self, blocks: Vec<BlockKind>) -> Self {
        self.blocks = blocks;
        self
    }

    /// Use `width` for the extraction layer and every round.
    pub fn with_width(mut self, width: usize) -> Self {
        self.extraction_width = width;
        self.rounds.width = width;
        self
    }

    pub fn with_rounds(mut self, rounds: RoundConfig) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_kernel(mut self, kernel: KernelConfig) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.extraction_width == 0 {
            return Err(Error::InvalidConfig("extraction width must be > 0".into()));
        }
        self.rounds.validate()?;
        self.kernel.validate()
    }
}

/// Feature extraction, one learned kernel, a sequence of rounds, max-pool.
#[derive(Debug, Clone)]
pub struct DmpsModel {
    extract: RowWiseMlp,
    kernel: DeepKernel,
    rounds: Vec<MessagePassingBlock>,
}

impl DmpsModel {
    /// Build a DMPS model for elements of width `in_features`.
    ///
    /// Parameters are owned per stage: `feature_extraction`, `kernel`, and
    /// `message_passing_{i}` for round `i`.
    pub fn new(config: &DmpsConfig, in_features: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let extract = RowWiseMlp::single(
            in_features,
            config.extraction_width,
            config.extraction_activation,
            vb.pp("feature_extraction"),
        )?;
        let kernel = DeepKernel::new(extract.out_features(), &config.kernel, vb.pp("kernel"))?;

        let mut rounds = Vec::with_capacity(config.blocks.len());
        let mut width = extract.out_features();
        for (i, &kind) in config.blocks.iter().enumerate() {
            let round = MessagePassingBlock::new(
                i,
                kind,
                width,
                &config.rounds,
                vb.pp(format!("message_passing_{i}")),
            )?;
            width = round.output_dim();
            rounds.push(round);
        }

        let model = Self {
            extract,
            kernel,
            rounds,
        };
        debug!(
            in_features,
            blocks = ?config.blocks,
            out_features = model.out_features(),
            "built DMPS model"
        );
        for (round, alpha) in model.gates()? {
            debug!(round, alpha, "denoising gate");
        }
        Ok(model)
    }

    pub fn in_features(&self) -> usize {
        self.extract.in_features()
    }

    /// Width of the pooled set representation.
    pub fn out_features(&self) -> usize {
        self.rounds
            .last()
            .map_or(self.extract.out_features(), MessagePassingBlock::output_dim)
    }

    pub fn rounds(&self) -> &[MessagePassingBlock] {
        &self.rounds
    }

    pub fn kernel(&self) -> &DeepKernel {
        &self.kernel
    }

    /// Current gate value of every denoising round, as `(round, α)`.
    pub fn gates(&self) -> Result<Vec<(usize, f64)>> {
        let mut gates = Vec::new();
        for round in &self.rounds {
            if let Some(alpha) = round.gate()? {
                gates.push((round.round(), alpha));
            }
        }
        Ok(gates)
    }

    /// Extracted element features: (B x N x F) -> (B x N x extraction_width).
    pub fn extract_features(&self, x: &Tensor) -> Result<Tensor> {
        expect_width(x, self.in_features())?;
        self.extract.forward(x)
    }

    /// Element features after every round, plus the kernel they shared.
    ///
    /// # Returns
    /// - `(features, kernel)`: (B x N x out_features) and (B x N x N)
    pub fn encode_elements(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut features = self.extract_features(x)?;
        let graph = self.kernel.forward(&features)?;
        for round in &self.rounds {
            features = round.forward(&features, &graph)?;
            trace!(round = round.round(), dims = ?features.dims(), "DMPS round complete");
        }
        Ok((features, graph))
    }

    /// Forward pass: (B x N x F) -> (B x out_features).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (features, _graph) = self.encode_elements(x)?;
        max_pool(&features)
    }
}

impl SetEncoder for DmpsModel {
    fn input_dim(&self) -> usize {
        self.in_features()
    }

    fn output_dim(&self) -> usize {
        self.out_features()
    }

    fn encode(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        self.forward(x)
    }
}
