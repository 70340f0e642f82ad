//! Annealed Langevin dynamics.
//!
//! Starting from uniform noise, sweep the noise levels from coarse to fine
//! (`i = n-1 … 0`) and run `annealed_step` updates at each one:
//! ```text
//! α_i = eps · (σ_i / σ_min)²
//! x ← x + α_i / 2 · s(x, i) + √α_i · z,    z ~ N(0, I)
//! ```
//! The sampler holds no state between calls; every trajectory starts afresh.

use candle_core::Tensor;

use super::score::ScoreModel;
use super::{check_same_shape, check_timestep};
use crate::config::ScoreConfig;
use crate::context::ExecutionContext;
use crate::model::DenoiserNetwork;
use crate::{Error, Result};

pub struct AnnealedLangevinDynamic<'a, N> {
    model: &'a ScoreModel<N>,
    annealed_step: usize,
    eps: f64,
    image_shape: (usize, usize, usize),
    ctx: ExecutionContext,
}

impl<'a, N: DenoiserNetwork> AnnealedLangevinDynamic<'a, N> {
    pub fn new(
        model: &'a ScoreModel<N>,
        annealed_step: usize,
        eps: f64,
        image_shape: (usize, usize, usize),
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        if annealed_step == 0 {
            return Err(Error::config("annealed_step must be positive"));
        }
        if !(eps > 0.0) {
            return Err(Error::config(format!("eps must be positive, got {eps}")));
        }
        Ok(Self {
            model,
            annealed_step,
            eps,
            image_shape,
            ctx: ctx.clone(),
        })
    }

    pub fn from_config(
        model: &'a ScoreModel<N>,
        cfg: &ScoreConfig,
        image_shape: (usize, usize, usize),
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        Self::new(model, cfg.annealed_step, cfg.eps, image_shape, ctx)
    }

    /// Step size `α_i` at noise level `i`.
    pub fn step_size(&self, level: usize) -> Result<f64> {
        let sigmas = self.model.sigmas();
        let ratio = sigmas.sigma(level)? / sigmas.sigma_min();
        Ok(self.eps * ratio * ratio)
    }

    /// One Langevin update at a fixed noise level.
    pub fn langevin_step(&self, x: &Tensor, level: usize) -> Result<Tensor> {
        check_timestep(level, 0, self.model.n_steps() - 1)?;
        let z = x.randn_like(0.0, 1.0)?;
        self.langevin_step_with_noise(x, level, &z)
    }

    /// One Langevin update with caller-supplied `z`.
    pub fn langevin_step_with_noise(
        &self,
        x: &Tensor,
        level: usize,
        z: &Tensor,
    ) -> Result<Tensor> {
        check_timestep(level, 0, self.model.n_steps() - 1)?;
        check_same_shape("noise", x, z)?;
        let alpha = self.step_size(level)?;
        let score = self.model.score_at(x, level)?;
        Ok(((x + (score * (alpha / 2.0))?)? + (z * alpha.sqrt())?)?)
    }

    /// Lazy trajectory from fresh uniform noise, one batch per noise level.
    pub fn trajectory(&self, n_samples: usize) -> Result<LangevinTrajectory<'_, 'a, N>> {
        let (c, h, w) = self.image_shape;
        let x = Tensor::rand(0f32, 1.0, (n_samples, c, h, w), &self.ctx.device)?
            .to_dtype(self.ctx.dtype)?;
        Ok(self.trajectory_from(x))
    }

    /// Lazy trajectory from a given starting batch.
    pub fn trajectory_from(&self, x: Tensor) -> LangevinTrajectory<'_, 'a, N> {
        LangevinTrajectory {
            sampler: self,
            x,
            next_level: self.model.n_steps().checked_sub(1),
        }
    }

    /// Run the full annealing schedule for `n_samples` images. Returns only
    /// the final batch when `only_final`, otherwise the batch after every
    /// noise level (`n_steps` batches, last one final).
    pub fn sampling(&self, n_samples: usize, only_final: bool) -> Result<Vec<Tensor>> {
        let trajectory = self.trajectory(n_samples)?;
        if only_final {
            let mut last = None;
            for batch in trajectory {
                last = Some(batch?);
            }
            Ok(last.into_iter().collect())
        } else {
            trajectory.collect()
        }
    }
}

/// Iterator over the batches produced at each noise level.
pub struct LangevinTrajectory<'s, 'a, N> {
    sampler: &'s AnnealedLangevinDynamic<'a, N>,
    x: Tensor,
    next_level: Option<usize>,
}

impl<N: DenoiserNetwork> LangevinTrajectory<'_, '_, N> {
    fn anneal(&self, level: usize) -> Result<Tensor> {
        let mut x = self.x.clone();
        for _ in 0..self.sampler.annealed_step {
            x = self.sampler.langevin_step(&x, level)?;
        }
        tracing::debug!(
            "Langevin level {level}: sigma={:.4}, alpha={:.3e}",
            self.sampler.model.sigmas().sigma(level)?,
            self.sampler.step_size(level)?
        );
        Ok(x)
    }
}

impl<N: DenoiserNetwork> Iterator for LangevinTrajectory<'_, '_, N> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let level = self.next_level?;
        match self.anneal(level) {
            Ok(x) => {
                self.next_level = level.checked_sub(1);
                self.x = x.clone();
                Some(Ok(x))
            }
            Err(e) => {
                self.next_level = None;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.next_level.map_or(0, |l| l + 1);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Conditioning;
    use crate::process::ddpm::tests::ZeroNet;
    use crate::process::score::tests::OracleScore;
    use crate::schedule::SigmaSchedule;
    use candle_core::{DType, Device};

    fn small_config() -> ScoreConfig {
        ScoreConfig {
            n_steps: 5,
            annealed_step: 3,
            ..Default::default()
        }
    }

    #[test]
    fn output_counts_and_shapes() {
        let ctx = ExecutionContext::cpu();
        let cfg = small_config();
        let model = ScoreModel::new(ZeroNet, &cfg, &ctx).unwrap();
        let sampler = AnnealedLangevinDynamic::from_config(&model, &cfg, (1, 6, 6), &ctx).unwrap();

        let all = sampler.sampling(4, false).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|b| b.dims() == &[4, 1, 6, 6]));

        let last = sampler.sampling(4, true).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].dims(), &[4, 1, 6, 6]);
    }

    #[test]
    fn step_size_shrinks_with_the_noise_level() {
        let ctx = ExecutionContext::cpu();
        let cfg = ScoreConfig::default();
        let model = ScoreModel::new(ZeroNet, &cfg, &ctx).unwrap();
        let sampler = AnnealedLangevinDynamic::from_config(&model, &cfg, (1, 28, 28), &ctx).unwrap();

        let alpha = |i| sampler.step_size(i).unwrap();
        assert!((alpha(0) - cfg.eps).abs() < 1e-12);
        let top = cfg.eps * (cfg.sigma_max / cfg.sigma_min).powi(2);
        assert!((alpha(99) - top).abs() / top < 1e-9);
        for i in 1..100 {
            assert!(alpha(i) > alpha(i - 1));
        }
    }

    /// Returns the same score everywhere.
    struct ConstantScore(f64);

    impl DenoiserNetwork for ConstantScore {
        fn forward(&self, xs: &Tensor, _t: &Tensor, _c: Conditioning<'_>) -> Result<Tensor> {
            Ok((xs.ones_like()? * self.0)?)
        }
    }

    #[test]
    fn update_follows_the_langevin_formula() {
        let ctx = ExecutionContext::cpu();
        let cfg = ScoreConfig {
            n_steps: 5,
            sigma_min: 0.01,
            sigma_max: 1.0,
            annealed_step: 1,
            eps: 1e-3,
        };
        let model = ScoreModel::new(ConstantScore(2.0), &cfg, &ctx).unwrap();
        let sampler = AnnealedLangevinDynamic::from_config(&model, &cfg, (1, 3, 3), &ctx).unwrap();

        // σ_2 / σ_min = 10, so α_2 = eps · 100.
        let alpha = sampler.step_size(2).unwrap();
        assert!((alpha - 0.1).abs() < 1e-12);

        let x = (Tensor::ones((2, 1, 3, 3), DType::F32, &Device::Cpu).unwrap() * 0.5).unwrap();
        let z = (x.ones_like().unwrap() * 0.25).unwrap();
        let out = sampler.langevin_step_with_noise(&x, 2, &z).unwrap();
        let expected = 0.5 + alpha / 2.0 * 2.0 + alpha.sqrt() * 0.25;
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values.len(), 18);
        assert!(values.iter().all(|v| (*v as f64 - expected).abs() < 1e-6), "{values:?}");

        let short = Tensor::zeros((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            sampler.langevin_step_with_noise(&x, 2, &short),
            Err(Error::ShapeMismatch { what: "noise", .. })
        ));
    }

    #[test]
    fn levels_past_the_schedule_are_errors() {
        let ctx = ExecutionContext::cpu();
        let cfg = small_config();
        let model = ScoreModel::new(ZeroNet, &cfg, &ctx).unwrap();
        let sampler = AnnealedLangevinDynamic::from_config(&model, &cfg, (1, 2, 2), &ctx).unwrap();
        let x = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();

        assert!(matches!(
            sampler.langevin_step(&x, 5),
            Err(Error::TimestepOutOfRange { t: 5, min: 0, max: 4 })
        ));
        assert!(matches!(
            sampler.langevin_step_with_noise(&x, 5, &x),
            Err(Error::TimestepOutOfRange { t: 5, .. })
        ));
        assert!(matches!(
            sampler.step_size(5),
            Err(Error::TimestepOutOfRange { t: 5, min: 0, max: 4 })
        ));
    }

    #[test]
    fn exact_score_pulls_samples_to_the_target() {
        let ctx = ExecutionContext::cpu();
        let dev = Device::Cpu;
        let cfg = ScoreConfig {
            n_steps: 10,
            sigma_min: 0.01,
            sigma_max: 1.0,
            annealed_step: 50,
            eps: 2e-5,
        };
        let target = (Tensor::ones((2, 1, 4, 4), candle_core::DType::F32, &dev).unwrap() * 0.5).unwrap();
        let sigmas = SigmaSchedule::geometric(cfg.sigma_min, cfg.sigma_max, cfg.n_steps).unwrap();
        let model = ScoreModel::new(
            OracleScore {
                x0: target.clone(),
                sigmas: sigmas.sigmas().to_vec(),
            },
            &cfg,
            &ctx,
        )
        .unwrap();
        let sampler = AnnealedLangevinDynamic::from_config(&model, &cfg, (1, 4, 4), &ctx).unwrap();

        let out = sampler.sampling(2, true).unwrap().remove(0);
        let err: f32 = (out - &target)
            .unwrap()
            .abs()
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(err < 0.1, "mean distance {err}");
    }

    #[test]
    fn trajectory_is_exact_size() {
        let ctx = ExecutionContext::cpu();
        let cfg = small_config();
        let model = ScoreModel::new(ZeroNet, &cfg, &ctx).unwrap();
        let sampler = AnnealedLangevinDynamic::from_config(&model, &cfg, (1, 2, 2), &ctx).unwrap();
        let trajectory = sampler.trajectory(1).unwrap();
        assert_eq!(trajectory.size_hint(), (5, Some(5)));
    }

    #[test]
    fn rejects_bad_parameters() {
        let ctx = ExecutionContext::cpu();
        let model = ScoreModel::new(ZeroNet, &small_config(), &ctx).unwrap();
        assert!(AnnealedLangevinDynamic::new(&model, 0, 1e-5, (1, 2, 2), &ctx).is_err());
        assert!(AnnealedLangevinDynamic::new(&model, 10, 0.0, (1, 2, 2), &ctx).is_err());
    }
}
