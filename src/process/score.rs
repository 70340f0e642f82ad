//! Multi-level denoising score matching.
//!
//! The network estimates `∇ log p_σ(x)` for a geometric ladder of noise
//! levels `σ_0 < … < σ_{n-1}`. Training perturbs `x = x_0 + σ_i · z` and
//! minimises
//! ```text
//! L = ½ · mean_batch Σ_pixels (σ_i · s(x, i) + z)²
//! ```
//! which is zero exactly when `s(x, i) = -(x - x_0) / σ_i²`.

use candle_core::{DType, Tensor};
use rand::Rng;

use super::{batch_indices, check_same_shape, full_timesteps, per_sample};
use crate::config::ScoreConfig;
use crate::context::ExecutionContext;
use crate::model::{Conditioning, DenoiserNetwork};
use crate::schedule::SigmaSchedule;
use crate::Result;

pub struct ScoreModel<N> {
    network: N,
    sigmas: SigmaSchedule,
    sigma_values: Tensor,
}

impl<N: DenoiserNetwork> ScoreModel<N> {
    pub fn new(network: N, cfg: &ScoreConfig, ctx: &ExecutionContext) -> Result<Self> {
        cfg.validate()?;
        let sigmas = SigmaSchedule::geometric(cfg.sigma_min, cfg.sigma_max, cfg.n_steps)?;
        let sigma_values = sigmas.to_tensor(ctx)?;
        tracing::debug!(
            "Score model: {} levels, sigma=[{}, {}]",
            cfg.n_steps,
            cfg.sigma_min,
            cfg.sigma_max
        );
        Ok(Self {
            network,
            sigmas,
            sigma_values,
        })
    }

    pub fn n_steps(&self) -> usize {
        self.sigmas.len()
    }

    pub fn sigmas(&self) -> &SigmaSchedule {
        &self.sigmas
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Score estimate with one noise level per sample.
    pub fn score(&self, x: &Tensor, levels: &Tensor) -> Result<Tensor> {
        batch_indices(levels, x.dim(0)?, 0, self.n_steps() - 1)?;
        self.network.forward(x, levels, Conditioning::Unconditional)
    }

    /// Score estimate with the same noise level for the whole batch.
    pub fn score_at(&self, x: &Tensor, level: usize) -> Result<Tensor> {
        let levels = full_timesteps(level, x.dim(0)?, x.device())?;
        self.score(x, &levels)
    }

    /// Training loss with levels `U[0, n)` and Gaussian perturbations.
    pub fn loss_fn<R: Rng>(&self, x0: &Tensor, rng: &mut R) -> Result<Tensor> {
        let n_steps = self.n_steps();
        let levels: Vec<u32> = (0..x0.dim(0)?)
            .map(|_| rng.random_range(0..n_steps) as u32)
            .collect();
        let levels = Tensor::new(levels.as_slice(), x0.device())?;
        let noise = x0.randn_like(0.0, 1.0)?;
        self.loss_with(x0, &levels, &noise)
    }

    /// Training loss for explicit levels and perturbations.
    pub fn loss_with(&self, x0: &Tensor, levels: &Tensor, noise: &Tensor) -> Result<Tensor> {
        check_same_shape("noise", x0, noise)?;
        batch_indices(levels, x0.dim(0)?, 0, self.n_steps() - 1)?;

        let ids = levels.flatten_all()?.to_dtype(DType::U32)?;
        let sigma = self
            .sigma_values
            .index_select(&ids, 0)?
            .to_dtype(x0.dtype())?;
        let sigma = per_sample(&sigma, x0.rank())?;

        let x_noisy = (x0 + noise.broadcast_mul(&sigma)?)?;
        let score = self.score(&x_noisy, levels)?;
        let residual = (score.broadcast_mul(&sigma)? + noise)?;
        let per_sample_loss = residual.sqr()?.flatten_from(1)?.sum(1)?;
        Ok((per_sample_loss.mean_all()? * 0.5)?)
    }
}
