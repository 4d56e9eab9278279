//! Set batch tensors.
//!
//! A set batch is a rank-3 tensor `(B, N, F)`: `B` independent sets, each with
//! `N` elements of `F` features. Axis 1 is the set axis. Its order is storage
//! only and carries no meaning.

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Axis holding the set elements.
pub const SET_AXIS: usize = 1;

/// Validate a set batch and return `(B, N, F)`.
pub fn set_batch_dims(x: &Tensor) -> Result<(usize, usize, usize)> {
    if x.rank() != 3 {
        return Err(Error::RankMismatch {
            expected: 3,
            got: x.rank(),
        });
    }
    let (b, n, f) = x.dims3()?;
    if b == 0 {
        return Err(Error::EmptyAxis { axis: "batch" });
    }
    if n == 0 {
        return Err(Error::EmptyAxis { axis: "element" });
    }
    if f == 0 {
        return Err(Error::EmptyAxis { axis: "feature" });
    }
    Ok((b, n, f))
}

/// Validate a set batch and check its feature width.
pub fn expect_width(x: &Tensor, width: usize) -> Result<(usize, usize, usize)> {
    let dims = set_batch_dims(x)?;
    if dims.2 != width {
        return Err(Error::DimensionMismatch {
            expected: width,
            got: dims.2,
        });
    }
    Ok(dims)
}

/// Build a `(B, N, F)` f32 tensor from nested vectors.
///
/// Every set must have the same number of elements and every element the
/// same number of features.
pub fn tensor_from_nested(sets: &[Vec<Vec<f32>>], device: &Device) -> Result<Tensor> {
    let b = sets.len();
    if b == 0 {
        return Err(Error::EmptyAxis { axis: "batch" });
    }
    let n = sets[0].len();
    if n == 0 {
        return Err(Error::EmptyAxis { axis: "element" });
    }
    let f = sets[0][0].len();
    if f == 0 {
        return Err(Error::EmptyAxis { axis: "feature" });
    }

    let mut flat = Vec::with_capacity(b * n * f);
    for set in sets {
        if set.len() != n {
            return Err(Error::DimensionMismatch {
                expected: n,
                got: set.len(),
            });
        }
        for element in set {
            if element.len() != f {
                return Err(Error::DimensionMismatch {
                    expected: f,
                    got: element.len(),
                });
            }
            flat.extend_from_slice(element);
        }
    }
    Ok(Tensor::from_vec(flat, (b, n, f), device)?)
}

/// Max-pool over the set axis: `(B, N, F) -> (B, F)`.
pub fn max_pool(x: &Tensor) -> Result<Tensor> {
    set_batch_dims(x)?;
    Ok(x.max(SET_AXIS)?)
}
