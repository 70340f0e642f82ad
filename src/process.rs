//! Forward/reverse corruption processes.
//!
//! Each process owns its schedule and its network and keeps no per-call
//! state: the current sample and timestep always come from the caller.
//!
//! - [`ddpm`]: Gaussian diffusion, noise-predicting reverse step
//! - [`conditional`]: DDPM carrying one class label per sample
//! - [`degradation`]: deterministic operators for cold diffusion
//! - [`cold`]: cold diffusion with two restoration strategies
//! - [`score`]: multi-level denoising score matching
//! - [`langevin`]: annealed Langevin dynamics sampler
//!
//! ## Timestep conventions
//!
//! DDPM timesteps are 0-based (`t ∈ [0, T)`); cold diffusion timesteps are
//! 1-based (`t ∈ [1, T]`, `D_0` is the identity); score-matching noise levels
//! are 0-based (`i ∈ [0, n_steps)`). Out-of-range values are rejected with
//! [`Error::TimestepOutOfRange`], never clamped.

pub mod cold;
pub mod conditional;
pub mod ddpm;
pub mod degradation;
pub mod langevin;
pub mod score;

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Read a per-sample index tensor (`[N]` or `[N, 1]`) and check it against the
/// batch size and the inclusive range `[min, max]`.
pub(crate) fn batch_indices(
    indices: &Tensor,
    batch: usize,
    min: usize,
    max: usize,
) -> Result<Vec<usize>> {
    let flat = indices.flatten_all()?;
    if flat.dim(0)? != batch {
        return Err(Error::ShapeMismatch {
            what: "timesteps",
            expected: vec![batch],
            actual: indices.dims().to_vec(),
        });
    }
    let values = flat.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    values
        .into_iter()
        .map(|t| {
            if t < min as i64 || t > max as i64 {
                Err(Error::TimestepOutOfRange { t, min, max })
            } else {
                Ok(t as usize)
            }
        })
        .collect()
}

/// Check a scalar timestep against the inclusive range `[min, max]`.
pub(crate) fn check_timestep(t: usize, min: usize, max: usize) -> Result<()> {
    if t < min || t > max {
        return Err(Error::TimestepOutOfRange {
            t: t as i64,
            min,
            max,
        });
    }
    Ok(())
}

pub(crate) fn check_same_shape(what: &'static str, expected: &Tensor, actual: &Tensor) -> Result<()> {
    if expected.dims() != actual.dims() {
        return Err(Error::ShapeMismatch {
            what,
            expected: expected.dims().to_vec(),
            actual: actual.dims().to_vec(),
        });
    }
    Ok(())
}

/// Reshape per-sample coefficients `[N]` to `[N, 1, …, 1]` of the given rank.
pub(crate) fn per_sample(coefficients: &Tensor, rank: usize) -> Result<Tensor> {
    let mut shape = vec![1usize; rank.max(1)];
    shape[0] = coefficients.elem_count();
    Ok(coefficients.reshape(shape)?)
}

/// `[N]` tensor filled with the same timestep.
pub(crate) fn full_timesteps(t: usize, batch: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::full(t as u32, batch, device)?)
}
