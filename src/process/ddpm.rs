//! Denoising diffusion probabilistic model.
//!
//! Forward corruption in closed form at any depth:
//! ```text
//! x_t = √ᾱ_t · x_0 + √(1 - ᾱ_t) · ε
//! ```
//!
//! Reverse update from the network's noise prediction `ε̂`:
//! ```text
//! x_{t-1} = (x_t - (1 - α_t) / √(1 - ᾱ_t) · ε̂) / √α_t + σ_t · z
//! ```
//! with `z ~ N(0, I)` for `t > 0` and `z = 0` at `t = 0`.

use candle_core::{DType, Tensor};

use super::{batch_indices, check_same_shape, check_timestep, per_sample};
use crate::config::{DdpmConfig, StepVariance};
use crate::context::ExecutionContext;
use crate::model::{Conditioning, DenoiserNetwork};
use crate::schedule::NoiseSchedule;
use crate::Result;

/// Gaussian diffusion process.
pub struct Ddpm<N> {
    network: N,
    schedule: NoiseSchedule,
    variance: StepVariance,
    sqrt_alpha_bars: Tensor,
    sqrt_one_minus_alpha_bars: Tensor,
}

impl<N: DenoiserNetwork> Ddpm<N> {
    pub fn new(network: N, cfg: &DdpmConfig, ctx: &ExecutionContext) -> Result<Self> {
        cfg.validate()?;
        let schedule = NoiseSchedule::linear(cfg.num_timesteps, cfg.beta_start, cfg.beta_end)?;
        let (sqrt_alpha_bars, sqrt_one_minus_alpha_bars) = schedule.forward_coefficients(ctx)?;
        tracing::debug!(
            "DDPM: T={}, beta=[{}, {}], variance={:?}",
            cfg.num_timesteps,
            cfg.beta_start,
            cfg.beta_end,
            cfg.variance
        );
        Ok(Self {
            network,
            schedule,
            variance: cfg.variance,
            sqrt_alpha_bars,
            sqrt_one_minus_alpha_bars,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Corrupt `x0` to depth `t` (one timestep per sample) using `noise`.
    pub fn add_noise(&self, x0: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        check_same_shape("noise", x0, noise)?;
        let batch = x0.dim(0)?;
        batch_indices(timesteps, batch, 0, self.num_timesteps() - 1)?;

        let ids = timesteps.flatten_all()?.to_dtype(DType::U32)?;
        let signal = self.sqrt_alpha_bars.index_select(&ids, 0)?.to_dtype(x0.dtype())?;
        let spread = self
            .sqrt_one_minus_alpha_bars
            .index_select(&ids, 0)?
            .to_dtype(x0.dtype())?;
        let signal = per_sample(&signal, x0.rank())?;
        let spread = per_sample(&spread, x0.rank())?;

        Ok((x0.broadcast_mul(&signal)? + noise.broadcast_mul(&spread)?)?)
    }

    /// Noise predicted by the network for `x_t`.
    pub fn reverse(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self.predict_noise(x_t, timesteps, Conditioning::Unconditional)
    }

    pub(crate) fn predict_noise(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        conditioning: Conditioning<'_>,
    ) -> Result<Tensor> {
        batch_indices(timesteps, x_t.dim(0)?, 0, self.num_timesteps() - 1)?;
        self.network.forward(x_t, timesteps, conditioning)
    }

    /// One reverse update `x_t → x_{t-1}`, drawing fresh noise for `t > 0`.
    pub fn step(&self, predicted_noise: &Tensor, t: usize, x_t: &Tensor) -> Result<Tensor> {
        check_timestep(t, 0, self.num_timesteps() - 1)?;
        let z = x_t.randn_like(0.0, 1.0)?;
        self.step_with_noise(predicted_noise, t, x_t, &z)
    }

    /// One reverse update with caller-supplied `z`, ignored at `t = 0`.
    pub fn step_with_noise(
        &self,
        predicted_noise: &Tensor,
        t: usize,
        x_t: &Tensor,
        z: &Tensor,
    ) -> Result<Tensor> {
        check_timestep(t, 0, self.num_timesteps() - 1)?;
        check_same_shape("predicted noise", x_t, predicted_noise)?;

        let alpha = self.schedule.alphas()[t];
        let beta = self.schedule.betas()[t];
        let alpha_bar = self.schedule.alpha_bars()[t];

        let coef = beta / (1.0 - alpha_bar).sqrt();
        let mean = ((x_t - (predicted_noise * coef)?)? * (1.0 / alpha.sqrt()))?;

        if t == 0 {
            return Ok(mean);
        }
        check_same_shape("noise", x_t, z)?;
        Ok((mean + (z * self.sigma(t)?)?)?)
    }

    /// Standard deviation of the noise added by the step at `t`.
    pub fn sigma(&self, t: usize) -> Result<f64> {
        check_timestep(t, 0, self.num_timesteps() - 1)?;
        let variance = match self.variance {
            StepVariance::Beta => self.schedule.betas()[t],
            StepVariance::Posterior => self.schedule.posterior_variance(t)?,
        };
        Ok(variance.sqrt())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Error;
    use candle_core::Device;

    /// Returns zeros; stands in for a network when only the math matters.
    pub(crate) struct ZeroNet;

    impl DenoiserNetwork for ZeroNet {
        fn forward(&self, xs: &Tensor, _t: &Tensor, _c: Conditioning<'_>) -> Result<Tensor> {
            Ok(xs.zeros_like()?)
        }
    }

    /// Knows `x0` and returns the noise that explains `x_t` exactly.
    struct OracleNoise {
        x0: Tensor,
        alpha_bars: Vec<f64>,
    }

    impl DenoiserNetwork for OracleNoise {
        fn forward(&self, xs: &Tensor, t: &Tensor, _c: Conditioning<'_>) -> Result<Tensor> {
            let t = t.flatten_all()?.to_vec1::<u32>()?[0] as usize;
            let ab = self.alpha_bars[t];
            let eps = ((xs - (&self.x0 * ab.sqrt())?)? / (1.0 - ab).sqrt())?;
            Ok(eps)
        }
    }

    fn small_config(num_timesteps: usize) -> DdpmConfig {
        DdpmConfig {
            num_timesteps,
            ..Default::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn add_noise_at_zero_keeps_the_image() {
        let ctx = ExecutionContext::cpu();
        let ddpm = Ddpm::new(ZeroNet, &DdpmConfig::default(), &ctx).unwrap();

        let x0 = Tensor::randn(0f32, 1.0, (4, 1, 28, 28), &Device::Cpu).unwrap();
        let noise = x0.zeros_like().unwrap();
        let t = Tensor::zeros(4, DType::U32, &Device::Cpu).unwrap();
        let xt = ddpm.add_noise(&x0, &noise, &t).unwrap();
        assert!(max_abs_diff(&xt, &x0) < 1e-3);
    }

    #[test]
    fn add_noise_uses_each_samples_timestep() {
        let ctx = ExecutionContext::cpu();
        let ddpm = Ddpm::new(ZeroNet, &small_config(100), &ctx).unwrap();
        let dev = Device::Cpu;

        let x0 = Tensor::ones((2, 1, 2, 2), DType::F32, &dev).unwrap();
        let noise = (Tensor::ones((2, 1, 2, 2), DType::F32, &dev).unwrap() * 2.0).unwrap();
        let t = Tensor::new(&[[10u32], [90]], &dev).unwrap();
        let xt = ddpm.add_noise(&x0, &noise, &t).unwrap();

        for (i, &ti) in [10usize, 90].iter().enumerate() {
            let ab = ddpm.schedule().alpha_bars()[ti];
            let expected = (ab.sqrt() + 2.0 * (1.0 - ab).sqrt()) as f32;
            let got: Vec<f32> = xt.get(i).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            assert!(got.iter().all(|v| (v - expected).abs() < 1e-5), "sample {i}: {got:?} vs {expected}");
        }
    }

    #[test]
    fn add_noise_validates_arguments() {
        let ctx = ExecutionContext::cpu();
        let ddpm = Ddpm::new(ZeroNet, &small_config(10), &ctx).unwrap();
        let dev = Device::Cpu;
        let x0 = Tensor::zeros((2, 1, 4, 4), DType::F32, &dev).unwrap();

        let bad_noise = Tensor::zeros((2, 1, 4, 3), DType::F32, &dev).unwrap();
        let t = Tensor::new(&[0u32, 1], &dev).unwrap();
        assert!(matches!(
            ddpm.add_noise(&x0, &bad_noise, &t),
            Err(Error::ShapeMismatch { what: "noise", .. })
        ));

        let t = Tensor::new(&[0u32, 10], &dev).unwrap();
        assert!(matches!(
            ddpm.add_noise(&x0, &x0, &t),
            Err(Error::TimestepOutOfRange { t: 10, min: 0, max: 9 })
        ));

        let t = Tensor::new(&[0u32], &dev).unwrap();
        assert!(matches!(
            ddpm.add_noise(&x0, &x0, &t),
            Err(Error::ShapeMismatch { what: "timesteps", .. })
        ));
    }

    #[test]
    fn oracle_reverse_chain_reconstructs_the_image() {
        let ctx = ExecutionContext::cpu();
        let dev = Device::Cpu;
        let cfg = small_config(50);
        let x0 = Tensor::randn(0f32, 1.0, (3, 1, 8, 8), &dev).unwrap();
        let schedule = NoiseSchedule::linear(50, cfg.beta_start, cfg.beta_end).unwrap();
        let oracle = OracleNoise {
            x0: x0.clone(),
            alpha_bars: schedule.alpha_bars().to_vec(),
        };
        let ddpm = Ddpm::new(oracle, &cfg, &ctx).unwrap();

        let mut x = Tensor::randn(0f32, 1.0, (3, 1, 8, 8), &dev).unwrap();
        for t in (0..ddpm.num_timesteps()).rev() {
            let ts = Tensor::full(t as u32, 3, &dev).unwrap();
            let eps = ddpm.reverse(&x, &ts).unwrap();
            x = ddpm.step(&eps, t, &x).unwrap();
        }
        let err = max_abs_diff(&x, &x0);
        assert!(err < 1e-3, "reconstruction error {err}");
    }

    #[test]
    fn last_step_is_deterministic() {
        let ctx = ExecutionContext::cpu();
        let ddpm = Ddpm::new(ZeroNet, &small_config(10), &ctx).unwrap();
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 1, 4, 4), &dev).unwrap();
        let eps = Tensor::randn(0f32, 1.0, (2, 1, 4, 4), &dev).unwrap();

        let a = ddpm.step(&eps, 0, &x).unwrap();
        let b = ddpm.step(&eps, 0, &x).unwrap();
        assert_eq!(max_abs_diff(&a, &b), 0.0);

        let a = ddpm.step(&eps, 5, &x).unwrap();
        let b = ddpm.step(&eps, 5, &x).unwrap();
        assert!(max_abs_diff(&a, &b) > 0.0);
    }

    #[test]
    fn step_with_noise_matches_the_update_rule() {
        let ctx = ExecutionContext::cpu();
        let ddpm = Ddpm::new(ZeroNet, &small_config(20), &ctx).unwrap();
        let dev = Device::Cpu;
        let x = Tensor::ones((1, 1, 2, 2), DType::F32, &dev).unwrap();
        let eps = Tensor::ones((1, 1, 2, 2), DType::F32, &dev).unwrap();
        let z = Tensor::ones((1, 1, 2, 2), DType::F32, &dev).unwrap();

        let t = 7;
        let s = ddpm.schedule();
        let expected = (1.0 - s.betas()[t] / (1.0 - s.alpha_bars()[t]).sqrt()) / s.alphas()[t].sqrt()
            + s.betas()[t].sqrt();
        let out: Vec<f32> = ddpm
            .step_with_noise(&eps, t, &x, &z)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(out.iter().all(|v| (*v as f64 - expected).abs() < 1e-5));
    }

    #[test]
    fn posterior_variance_is_smaller() {
        let ctx = ExecutionContext::cpu();
        let beta = Ddpm::new(ZeroNet, &small_config(100), &ctx).unwrap();
        let posterior = Ddpm::new(
            ZeroNet,
            &DdpmConfig {
                num_timesteps: 100,
                variance: StepVariance::Posterior,
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();
        for t in 1..100 {
            assert!(posterior.sigma(t).unwrap() < beta.sigma(t).unwrap());
        }
    }

    #[test]
    fn step_rejects_out_of_range_timestep() {
        let ctx = ExecutionContext::cpu();
        let ddpm = Ddpm::new(ZeroNet, &small_config(10), &ctx).unwrap();
        let x = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            ddpm.step(&x, 10, &x),
            Err(Error::TimestepOutOfRange { t: 10, .. })
        ));
        assert!(matches!(
            ddpm.sigma(10),
            Err(Error::TimestepOutOfRange { t: 10, min: 0, max: 9 })
        ));
    }
}
