//! Cold diffusion: deterministic degradation instead of Gaussian noise.
//!
//! The network learns `R(x_t, t) ≈ x_0`. Sampling walks a degraded image
//! back one level at a time with one of two restoration rules:
//! ```text
//! naive:     x_{t-1} = x_t - D_t(x̂_0) + D_{t-1}(x̂_0)
//! improved:  p = D_{t-1}(x̂_0),  c = S_t(x̂_0, p)
//!            x_{t-1} = ½ · ((x_t - c + p) + p)
//! ```
//! Both rules land exactly on `D_{t-1}(x_0)` when `x̂_0` is exact.

use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::degradation::Degradation;
use super::{batch_indices, check_same_shape, check_timestep, full_timesteps};
use crate::model::{Conditioning, DenoiserNetwork};
use crate::{Error, Result};

/// Restoration rule used by [`ColdDiffusion::restore_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStrategy {
    /// Re-degrade the estimate to both depths.
    Naive,
    /// Re-degrade to `t-1`, advance a single level and average.
    #[default]
    Improved,
}

impl FromStr for RestoreStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" | "naive" => Ok(Self::Naive),
            "2" | "improved" => Ok(Self::Improved),
            other => Err(Error::config(format!("unknown restore strategy '{other}'"))),
        }
    }
}

pub struct ColdDiffusion<D, N> {
    degradation: D,
    network: N,
    num_timesteps: usize,
}

impl<D: Degradation, N: DenoiserNetwork> ColdDiffusion<D, N> {
    pub fn new(network: N, degradation: D, num_timesteps: usize) -> Result<Self> {
        if num_timesteps == 0 {
            return Err(Error::config("num_timesteps must be positive"));
        }
        tracing::debug!(
            "Cold diffusion: {} degradation, T={num_timesteps}",
            degradation.name()
        );
        Ok(Self {
            degradation,
            network,
            num_timesteps,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn degradation(&self) -> &D {
        &self.degradation
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// `D_t(x0)` with one `t ∈ [1, T]` per sample.
    pub fn forward_process(&self, x0: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let ts = batch_indices(timesteps, x0.dim(0)?, 1, self.num_timesteps)?;
        let Some(&max_t) = ts.iter().max() else {
            return Ok(x0.clone());
        };
        if ts.iter().all(|&t| t == max_t) {
            return self.degradation.degrade(x0, max_t);
        }

        // One degradation per distinct depth, scattered back into place.
        let mut depths = ts.clone();
        depths.sort_unstable();
        depths.dedup();
        let mut out = x0.zeros_like()?;
        for depth in depths {
            let ids: Vec<u32> = ts
                .iter()
                .enumerate()
                .filter(|&(_, &t)| t == depth)
                .map(|(i, _)| i as u32)
                .collect();
            let ids = Tensor::new(ids.as_slice(), x0.device())?;
            let degraded = self
                .degradation
                .degrade(&x0.index_select(&ids, 0)?, depth)?
                .contiguous()?;
            out = out.index_add(&ids, &degraded, 0)?;
        }
        Ok(out)
    }

    /// `D_t(x0)` for the whole batch.
    pub fn forward_process_at(&self, x0: &Tensor, t: usize) -> Result<Tensor> {
        check_timestep(t, 1, self.num_timesteps)?;
        self.degradation.degrade(x0, t)
    }

    /// Clean-image estimate `x̂_0` from the network.
    pub fn reverse(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        batch_indices(timesteps, x_t.dim(0)?, 1, self.num_timesteps)?;
        self.network
            .forward(x_t, timesteps, Conditioning::Unconditional)
    }

    /// One restoration step `x_t → x_{t-1}` driven by the network's estimate.
    pub fn restore_step(&self, x_t: &Tensor, t: usize, strategy: RestoreStrategy) -> Result<Tensor> {
        check_timestep(t, 1, self.num_timesteps)?;
        let timesteps = full_timesteps(t, x_t.dim(0)?, x_t.device())?;
        let x0_hat = self.reverse(x_t, &timesteps)?;
        self.restore_from_estimate(x_t, t, &x0_hat, strategy)
    }

    /// One restoration step from a given clean-image estimate.
    pub fn restore_from_estimate(
        &self,
        x_t: &Tensor,
        t: usize,
        x0_hat: &Tensor,
        strategy: RestoreStrategy,
    ) -> Result<Tensor> {
        check_timestep(t, 1, self.num_timesteps)?;
        check_same_shape("estimate", x_t, x0_hat)?;

        let prev = self.degradation.degrade(x0_hat, t - 1)?;
        match strategy {
            RestoreStrategy::Naive => {
                let curr = self.degradation.degrade(x0_hat, t)?;
                Ok(((x_t - curr)? + prev)?)
            }
            RestoreStrategy::Improved => {
                let curr = self.degradation.degrade_step(x0_hat, &prev, t)?;
                let corrected = ((x_t - curr)? + &prev)?;
                Ok(((corrected + &prev)? * 0.5)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DegradationConfig;
    use crate::process::degradation::from_config;
    use candle_core::Device;

    /// Always answers with the true clean batch.
    struct OracleImage(Tensor);

    impl DenoiserNetwork for OracleImage {
        fn forward(&self, _xs: &Tensor, _t: &Tensor, _c: Conditioning<'_>) -> Result<Tensor> {
            Ok(self.0.clone())
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

    fn operators() -> Vec<(DegradationConfig, usize)> {
        vec![
            (DegradationConfig::Median { kernel_size: 3 }, 10),
            (DegradationConfig::mean_kernel(), 30),
            (DegradationConfig::SuperResolution, 8),
        ]
    }

    #[test]
    fn oracle_restore_lands_on_the_previous_level() {
        let x0 = Tensor::rand(0f32, 1.0, (2, 1, 28, 28), &Device::Cpu).unwrap();
        for (cfg, depth) in operators() {
            let cold = ColdDiffusion::new(OracleImage(x0.clone()), from_config(&cfg).unwrap(), depth)
                .unwrap();
            for strategy in [RestoreStrategy::Naive, RestoreStrategy::Improved] {
                for t in [1, depth / 2, depth] {
                    let x_t = cold.forward_process_at(&x0, t).unwrap();
                    let restored = cold.restore_step(&x_t, t, strategy).unwrap();
                    let expected = cold.degradation().degrade(&x0, t - 1).unwrap();
                    let err = max_abs_diff(&restored, &expected);
                    assert!(err < 1e-6, "{cfg:?} {strategy:?} t={t}: {err}");
                }
            }
        }
    }

    #[test]
    fn oracle_chain_recovers_the_image() {
        let x0 = Tensor::rand(0f32, 1.0, (1, 1, 28, 28), &Device::Cpu).unwrap();
        let cfg = DegradationConfig::mean_kernel();
        let cold = ColdDiffusion::new(OracleImage(x0.clone()), from_config(&cfg).unwrap(), 30).unwrap();

        let mut x = cold.forward_process_at(&x0, 25).unwrap();
        for t in (1..=25).rev() {
            x = cold.restore_step(&x, t, RestoreStrategy::Improved).unwrap();
        }
        assert!(max_abs_diff(&x, &x0) < 1e-5);
    }

    #[test]
    fn depth_one_is_a_single_application() {
        let x0 = Tensor::rand(0f32, 1.0, (3, 1, 8, 8), &Device::Cpu).unwrap();
        for (cfg, depth) in operators() {
            let op = from_config(&cfg).unwrap();
            let once = op.degrade_step(&x0, &x0, 1).unwrap();
            let cold = ColdDiffusion::new(OracleImage(x0.clone()), op, depth).unwrap();
            let t = Tensor::new(&[1u32, 1, 1], &Device::Cpu).unwrap();
            let got = cold.forward_process(&x0, &t).unwrap();
            assert_eq!(max_abs_diff(&got, &once), 0.0, "{cfg:?}");
        }
    }

    #[test]
    fn per_sample_depths() {
        let x0 = Tensor::rand(0f32, 1.0, (3, 1, 8, 8), &Device::Cpu).unwrap();
        for (cfg, _) in operators() {
            let cold =
                ColdDiffusion::new(OracleImage(x0.clone()), from_config(&cfg).unwrap(), 8).unwrap();
            let t = Tensor::new(&[5u32, 1, 8], &Device::Cpu).unwrap();
            let got = cold.forward_process(&x0, &t).unwrap();
            for (i, depth) in [5usize, 1, 8].into_iter().enumerate() {
                let sample = x0.narrow(0, i, 1).unwrap();
                let expected = cold.forward_process_at(&sample, depth).unwrap();
                let err = max_abs_diff(&got.narrow(0, i, 1).unwrap(), &expected);
                assert!(err < 1e-6, "{cfg:?} sample {i}: {err}");
            }
        }
    }

    #[test]
    fn rejects_timesteps_outside_one_to_t() {
        let x0 = Tensor::zeros((1, 1, 4, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let cfg = DegradationConfig::Median { kernel_size: 3 };
        let cold = ColdDiffusion::new(OracleImage(x0.clone()), from_config(&cfg).unwrap(), 10).unwrap();

        assert!(matches!(
            cold.restore_step(&x0, 0, RestoreStrategy::Naive),
            Err(Error::TimestepOutOfRange { t: 0, min: 1, max: 10 })
        ));
        assert!(matches!(
            cold.forward_process_at(&x0, 11),
            Err(Error::TimestepOutOfRange { t: 11, .. })
        ));
        let t = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        assert!(cold.forward_process(&x0, &t).is_err());
    }

    #[test]
    fn strategy_names() {
        assert_eq!("1".parse::<RestoreStrategy>().unwrap(), RestoreStrategy::Naive);
        assert_eq!("improved".parse::<RestoreStrategy>().unwrap(), RestoreStrategy::Improved);
        assert!("3".parse::<RestoreStrategy>().is_err());
    }
}
