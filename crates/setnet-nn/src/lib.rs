//! Permutation-aware encoders for sets.
//!
//! A set batch is a tensor `(B, N, F)` whose element axis `N` has no order.
//! The models here map it to one vector per set, `(B, F')`, and give the
//! same answer for every ordering of the elements.
//!
//! ## Two Kinds of Symmetry
//!
//! ```text
//! equivariant:  f(π x) = π f(x)     (per-element layers)
//! invariant:    g(π x) = g(x)       (pooling)
//! ```
//!
//! Every layer that keeps the element axis must be equivariant. The final
//! reduction over it must be invariant. A model composed only of these two
//! kinds of stages is invariant end to end.
//!
//! Equivariance comes from two ingredients:
//!
//! - **Shared row-wise transforms**: the same weights for every element
//!   ([`row_wise::RowWiseMlp`]).
//! - **Symmetric set statistics**: max, mean or sum over `N`, broadcast back
//!   to every element or used as the final pool.
//!
//! ## Architectures
//!
//! ### DeepSets
//!
//! [Zaheer et al. 2017](https://arxiv.org/abs/1703.06114). Three
//! centre-then-transform blocks, then max-pool:
//!
//! ```text
//! h ← σ(W (h - max_N h) + b)    × 3
//! z = max_N h
//! ```
//!
//! ### DMPS
//!
//! [Shi et al. 2020](https://arxiv.org/abs/1909.09877). Deep message passing
//! on sets learns a soft graph among the elements and diffuses features over
//! it:
//!
//! ```text
//! h = σ(W_0 x + b_0)
//! K = kernel(h)                       built once
//! h ← round_i(h, K)                   plain | denoising | residual
//! z = max_N h
//! ```
//!
//! | Round | Update |
//! |-------|--------|
//! | plain | `σ(W d + b)` |
//! | denoising | `[σ(W (α h + (1-α) d) + b) ‖ h]` |
//! | residual | `σ(W d + b) + d` |
//!
//! where `d = pool(K, h)` is an approximate max over `K_ij h_j`.
//!
//! ## Modules
//!
//! - [`set`]: set batch validation and pooling helpers
//! - [`row_wise`]: shared per-element MLPs
//! - [`kernel`]: learned kernel graphs and graph pooling
//! - [`pooling`]: set pooling head
//! - [`deep_sets`]: equivariant blocks and the DeepSets model
//! - [`message_passing`]: DMPS rounds
//! - [`dmps`]: the DMPS model
//! - [`model`]: serializable architecture selection
//!
//! ## Example: DeepSets Forward Pass
//!
//! ```rust,ignore
//! use setnet_nn::deep_sets::{DeepSetsConfig, DeepSetsModel};
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//!
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let model = DeepSetsModel::new(&DeepSetsConfig::default(), 3, vb)?;
//!
//! let x = Tensor::randn(0f32, 1f32, (8, 20, 3), &Device::Cpu)?; // 8 sets of 20 points
//! let z = model.forward(&x)?;                                    // (8, 256)
//! ```

use candle_core::Tensor;

pub mod activation;
pub mod deep_sets;
pub mod dmps;
pub mod error;
pub mod kernel;
pub mod message_passing;
pub mod model;
pub mod pooling;
pub mod row_wise;
pub mod set;

pub use activation::Activation;
pub use deep_sets::{DeepSetsConfig, DeepSetsModel, EquivariantBlock, Reduction};
pub use dmps::{DmpsConfig, DmpsModel};
pub use error::{Error, Result};
pub use kernel::{pool_on_kernel, DeepKernel, KernelConfig, PoolOp};
pub use message_passing::{BlockKind, MessagePassingBlock, RoundConfig};
pub use model::{ModelConfig, SetModel};
pub use pooling::{PoolingConfig, RefineConfig, SetPoolingHead};
pub use row_wise::{LayerSpec, RowWiseMlp};

/// A model mapping set batches `(B, N, F)` to set representations `(B, F')`.
pub trait SetEncoder {
    /// Element width `F` the model accepts.
    fn input_dim(&self) -> usize;

    /// Width `F'` of the set representation.
    fn output_dim(&self) -> usize;

    /// Encode a set batch. `train` enables training-only regularization.
    fn encode(&self, x: &Tensor, train: bool) -> Result<Tensor>;
}
