//! Training driver.
//!
//! One [`Trainer`] per run: it owns the AdamW optimiser over the network's
//! [`VarMap`] and a seeded RNG used for shuffling and for timestep draws.
//! Each `train_*` method runs `epochs` full passes over an in-memory
//! dataset `[N, C, H, W]` and returns the mean loss of every epoch.
//!
//! | process     | timestep draw     | target           |
//! |-------------|-------------------|------------------|
//! | DDPM        | `t ~ U[0, T)`     | the added noise  |
//! | cold        | `t ~ U[1, T)`     | the clean image  |
//! | score       | `i ~ U[0, n)`     | score loss       |

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::TrainingConfig;
use crate::model::DenoiserNetwork;
use crate::process::cold::ColdDiffusion;
use crate::process::conditional::ConditionalDdpm;
use crate::process::ddpm::Ddpm;
use crate::process::degradation::Degradation;
use crate::process::score::ScoreModel;
use crate::{Error, Result};

pub struct Trainer {
    optimizer: AdamW,
    config: TrainingConfig,
    rng: ChaCha8Rng,
}

impl Trainer {
    pub fn new(varmap: &VarMap, config: &TrainingConfig) -> Result<Self> {
        config.validate()?;
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            optimizer,
            config: config.clone(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Noise-prediction MSE on `t ~ U[0, T)`.
    pub fn train_ddpm<N: DenoiserNetwork>(
        &mut self,
        ddpm: &Ddpm<N>,
        images: &Tensor,
    ) -> Result<Vec<f64>> {
        let num_timesteps = ddpm.num_timesteps();
        self.run("ddpm", images, |batch_ids, rng| {
            let x0 = images.index_select(batch_ids, 0)?;
            let timesteps = draw_timesteps(rng, x0.dim(0)?, 0..num_timesteps, &x0)?;
            let noise = x0.randn_like(0.0, 1.0)?;
            let noisy = ddpm.add_noise(&x0, &noise, &timesteps)?;
            let predicted = ddpm.reverse(&noisy, &timesteps)?;
            Ok(candle_nn::loss::mse(&predicted, &noise)?)
        })
    }

    /// Noise-prediction MSE with each image's class label.
    pub fn train_conditional<N: DenoiserNetwork>(
        &mut self,
        ddpm: &ConditionalDdpm<N>,
        images: &Tensor,
        labels: &Tensor,
    ) -> Result<Vec<f64>> {
        let labels = labels.flatten_all()?;
        if labels.dim(0)? != images.dim(0)? {
            return Err(Error::ShapeMismatch {
                what: "labels",
                expected: vec![images.dim(0)?],
                actual: labels.dims().to_vec(),
            });
        }
        let num_timesteps = ddpm.num_timesteps();
        self.run("ddpm_conditional", images, |batch_ids, rng| {
            let x0 = images.index_select(batch_ids, 0)?;
            let y = labels.index_select(batch_ids, 0)?;
            let timesteps = draw_timesteps(rng, x0.dim(0)?, 0..num_timesteps, &x0)?;
            let noise = x0.randn_like(0.0, 1.0)?;
            let noisy = ddpm.add_noise(&x0, &noise, &timesteps)?;
            let predicted = ddpm.reverse(&noisy, &timesteps, Some(&y))?;
            Ok(candle_nn::loss::mse(&predicted, &noise)?)
        })
    }

    /// Clean-image MSE on `t ~ U[1, T)`.
    pub fn train_cold<D: Degradation, N: DenoiserNetwork>(
        &mut self,
        cold: &ColdDiffusion<D, N>,
        images: &Tensor,
    ) -> Result<Vec<f64>> {
        // With T = 1 the only valid depth is 1.
        let upper = cold.num_timesteps().max(2);
        self.run("cold", images, |batch_ids, rng| {
            let x0 = images.index_select(batch_ids, 0)?;
            let timesteps = draw_timesteps(rng, x0.dim(0)?, 1..upper, &x0)?;
            let degraded = cold.forward_process(&x0, &timesteps)?;
            let predicted = cold.reverse(&degraded, &timesteps)?;
            Ok(candle_nn::loss::mse(&predicted, &x0)?)
        })
    }

    /// Denoising score matching over random noise levels.
    pub fn train_score<N: DenoiserNetwork>(
        &mut self,
        model: &ScoreModel<N>,
        images: &Tensor,
    ) -> Result<Vec<f64>> {
        self.run("score", images, |batch_ids, rng| {
            let x0 = images.index_select(batch_ids, 0)?;
            model.loss_fn(&x0, rng)
        })
    }

    fn run<F>(&mut self, name: &str, images: &Tensor, mut batch_loss: F) -> Result<Vec<f64>>
    where
        F: FnMut(&Tensor, &mut ChaCha8Rng) -> Result<Tensor>,
    {
        let n = images.dim(0)?;
        if n == 0 {
            return Err(Error::config("training set is empty"));
        }
        let Self {
            optimizer,
            config,
            rng,
        } = self;
        tracing::info!(
            "Training {name}: {n} images, {} epochs, batch size {}",
            config.epochs,
            config.batch_size
        );

        let mut order: Vec<u32> = (0..n as u32).collect();
        let mut epoch_losses = Vec::with_capacity(config.epochs);
        for epoch in 0..config.epochs {
            order.shuffle(rng);
            let mut total = 0.0;
            let mut batches = 0usize;
            for chunk in order.chunks(config.batch_size) {
                let ids = Tensor::new(chunk, images.device())?;
                let loss = batch_loss(&ids, rng)?;
                optimizer.backward_step(&loss)?;
                total += loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                batches += 1;
                tracing::debug!("epoch {epoch} batch {batches}");
            }
            let mean = total / batches as f64;
            if (epoch + 1) % config.log_interval == 0 || epoch + 1 == config.epochs {
                tracing::info!("Epoch {:>4}/{} | loss {mean:.6}", epoch + 1, config.epochs);
            }
            epoch_losses.push(mean);
        }
        Ok(epoch_losses)
    }
}

/// One timestep per sample, uniform over `range`.
fn draw_timesteps(
    rng: &mut ChaCha8Rng,
    batch: usize,
    range: std::ops::Range<usize>,
    like: &Tensor,
) -> Result<Tensor> {
    let ts: Vec<u32> = (0..batch)
        .map(|_| rng.random_range(range.clone()) as u32)
        .collect();
    Ok(Tensor::from_vec(ts, batch, like.device())?)
}
