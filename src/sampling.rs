//! Sampling drivers.
//!
//! DDPM sampling starts from `x_T ~ N(0, I)` and calls the reverse step once
//! per timestep `T-1 … 0`, optionally keeping a copy of the batch right after
//! a chosen timestep. Cold sampling degrades real images to a chosen depth and
//! restores them level by level, finishing with the network's direct estimate
//! at `t = 1`.

use candle_core::Tensor;

use crate::context::ExecutionContext;
use crate::model::DenoiserNetwork;
use crate::process::cold::{ColdDiffusion, RestoreStrategy};
use crate::process::conditional::ConditionalDdpm;
use crate::process::ddpm::Ddpm;
use crate::process::degradation::Degradation;
use crate::process::{check_timestep, full_timesteps};
use crate::Result;

/// Final batch plus an optional mid-trajectory snapshot.
#[derive(Debug, Clone)]
pub struct GeneratedImages {
    pub samples: Tensor,
    pub snapshot: Option<Tensor>,
}

fn gaussian_batch(
    sample_size: usize,
    (c, h, w): (usize, usize, usize),
    ctx: &ExecutionContext,
) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (sample_size, c, h, w), &ctx.device)?.to_dtype(ctx.dtype)?)
}

fn denoise<N, F>(
    ddpm: &Ddpm<N>,
    mut x: Tensor,
    snapshot_at: Option<usize>,
    mut predict: F,
) -> Result<GeneratedImages>
where
    N: DenoiserNetwork,
    F: FnMut(&Tensor, &Tensor) -> Result<Tensor>,
{
    let n = x.dim(0)?;
    let num_timesteps = ddpm.num_timesteps();
    let mut snapshot = None;

    for t in (0..num_timesteps).rev() {
        let timesteps = full_timesteps(t, n, x.device())?;
        let predicted_noise = predict(&x, &timesteps)?;
        x = ddpm.step(&predicted_noise, t, &x)?;

        if snapshot_at == Some(t) {
            snapshot = Some(x.clone());
        }
        if t % 100 == 0 {
            tracing::debug!("Denoising: t={t}");
        }
    }

    Ok(GeneratedImages {
        samples: x,
        snapshot,
    })
}

/// Unconditional DDPM sampling of `sample_size` images of shape `(C, H, W)`.
pub fn generate_image<N: DenoiserNetwork>(
    ddpm: &Ddpm<N>,
    sample_size: usize,
    image_shape: (usize, usize, usize),
    snapshot_at: Option<usize>,
    ctx: &ExecutionContext,
) -> Result<GeneratedImages> {
    tracing::info!(
        "Generating {sample_size} images over {} timesteps",
        ddpm.num_timesteps()
    );
    let x = gaussian_batch(sample_size, image_shape, ctx)?;
    let out = denoise(ddpm, x, snapshot_at, |x, t| ddpm.reverse(x, t))?;
    tracing::info!("Generation done");
    Ok(out)
}

/// DDPM sampling steered by one label per image (`None` for unconditional).
pub fn generate_image_conditional<N: DenoiserNetwork>(
    ddpm: &ConditionalDdpm<N>,
    labels: Option<&Tensor>,
    sample_size: usize,
    image_shape: (usize, usize, usize),
    snapshot_at: Option<usize>,
    ctx: &ExecutionContext,
) -> Result<GeneratedImages> {
    tracing::info!(
        "Generating {sample_size} images over {} timesteps (labels: {})",
        ddpm.num_timesteps(),
        labels.is_some()
    );
    let x = gaussian_batch(sample_size, image_shape, ctx)?;
    let out = denoise(ddpm.ddpm(), x, snapshot_at, |x, t| ddpm.reverse(x, t, labels))?;
    tracing::info!("Generation done");
    Ok(out)
}

/// Degrade `images` to `depth`, then restore them back to clean estimates.
pub fn generate_image_cold<D: Degradation, N: DenoiserNetwork>(
    cold: &ColdDiffusion<D, N>,
    images: &Tensor,
    depth: usize,
    strategy: RestoreStrategy,
) -> Result<Tensor> {
    check_timestep(depth, 1, cold.num_timesteps())?;
    tracing::info!(
        "Restoring {} images from depth {depth} ({strategy:?})",
        images.dim(0)?
    );

    let mut x = cold.forward_process_at(images, depth)?;
    for t in (2..=depth).rev() {
        x = cold.restore_step(&x, t, strategy)?;
        tracing::debug!("Restored level {t}");
    }
    let timesteps = full_timesteps(1, x.dim(0)?, x.device())?;
    let out = cold.reverse(&x, &timesteps)?;

    tracing::info!("Restoration done");
    Ok(out)
}
