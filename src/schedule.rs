//! Per-timestep corruption schedules.
//!
//! Two families, both built once at process construction and read-only
//! afterwards:
//!
//! - [`NoiseSchedule`]: linear β schedule for Gaussian diffusion:
//!   ```text
//!   β_t  = β_start + (β_end - β_start) * t / (T - 1)
//!   α_t  = 1 - β_t
//!   ᾱ_t  = ∏_{i ≤ t} α_i
//!   ```
//! - [`SigmaSchedule`]: geometric noise levels for score matching:
//!   ```text
//!   σ_i = σ_min * (σ_max / σ_min)^(i / (n - 1))
//!   ```

use candle_core::Tensor;

use crate::context::ExecutionContext;
use crate::process::check_timestep;
use crate::{Error, Result};

/// Linear β schedule with its derived α and ᾱ sequences.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alpha_bars: Vec<f64>,
}

impl NoiseSchedule {
    /// Build a schedule of `num_timesteps` linearly spaced betas.
    pub fn linear(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Result<Self> {
        if num_timesteps == 0 {
            return Err(Error::config("num_timesteps must be positive"));
        }
        if !(beta_start > 0.0 && beta_end < 1.0 && beta_start <= beta_end) {
            return Err(Error::config(format!(
                "beta range must satisfy 0 < beta_start <= beta_end < 1, got [{beta_start}, {beta_end}]"
            )));
        }

        let denom = (num_timesteps - 1).max(1) as f64;
        let betas: Vec<f64> = (0..num_timesteps)
            .map(|t| beta_start + (beta_end - beta_start) * t as f64 / denom)
            .collect();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alpha_bars = Vec::with_capacity(num_timesteps);
        let mut product = 1.0;
        for &alpha in &alphas {
            product *= alpha;
            alpha_bars.push(product);
        }

        Ok(Self {
            betas,
            alphas,
            alpha_bars,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alpha_bars(&self) -> &[f64] {
        &self.alpha_bars
    }

    /// ᾱ_{t-1}, with ᾱ_{-1} = 1.
    pub fn alpha_bar_prev(&self, t: usize) -> Result<f64> {
        check_timestep(t, 0, self.num_timesteps() - 1)?;
        Ok(if t == 0 { 1.0 } else { self.alpha_bars[t - 1] })
    }

    /// Posterior variance β̃_t = β_t (1 - ᾱ_{t-1}) / (1 - ᾱ_t).
    pub fn posterior_variance(&self, t: usize) -> Result<f64> {
        let prev = self.alpha_bar_prev(t)?;
        Ok(self.betas[t] * (1.0 - prev) / (1.0 - self.alpha_bars[t]))
    }

    /// `(√ᾱ_t, √(1 - ᾱ_t))` as `[T]` tensors, for batched gathers.
    pub fn forward_coefficients(&self, ctx: &ExecutionContext) -> Result<(Tensor, Tensor)> {
        let sqrt_ab: Vec<f32> = self.alpha_bars.iter().map(|ab| ab.sqrt() as f32).collect();
        let sqrt_one_minus: Vec<f32> = self
            .alpha_bars
            .iter()
            .map(|ab| (1.0 - ab).sqrt() as f32)
            .collect();
        let n = self.num_timesteps();
        let sqrt_ab = Tensor::from_vec(sqrt_ab, n, &ctx.device)?.to_dtype(ctx.dtype)?;
        let sqrt_one_minus = Tensor::from_vec(sqrt_one_minus, n, &ctx.device)?.to_dtype(ctx.dtype)?;
        Ok((sqrt_ab, sqrt_one_minus))
    }
}

/// Geometrically spaced noise levels for score matching.
#[derive(Debug, Clone)]
pub struct SigmaSchedule {
    sigmas: Vec<f64>,
}

impl SigmaSchedule {
    pub fn geometric(sigma_min: f64, sigma_max: f64, n_steps: usize) -> Result<Self> {
        if n_steps == 0 {
            return Err(Error::config("n_steps must be positive"));
        }
        if !(sigma_min > 0.0 && sigma_min < sigma_max) {
            return Err(Error::config(format!(
                "sigma range must satisfy 0 < sigma_min < sigma_max, got [{sigma_min}, {sigma_max}]"
            )));
        }

        let ratio = sigma_max / sigma_min;
        let denom = (n_steps - 1).max(1) as f64;
        let sigmas = (0..n_steps)
            .map(|i| sigma_min * ratio.powf(i as f64 / denom))
            .collect();
        Ok(Self { sigmas })
    }

    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn sigma(&self, i: usize) -> Result<f64> {
        check_timestep(i, 0, self.sigmas.len().saturating_sub(1))?;
        Ok(self.sigmas[i])
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigmas[0]
    }

    /// σ_i as a `[n]` tensor.
    pub fn to_tensor(&self, ctx: &ExecutionContext) -> Result<Tensor> {
        let sigmas: Vec<f32> = self.sigmas.iter().map(|&s| s as f32).collect();
        Ok(Tensor::from_vec(sigmas, self.sigmas.len(), &ctx.device)?.to_dtype(ctx.dtype)?)
    }
}
