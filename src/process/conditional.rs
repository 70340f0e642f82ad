//! Class-conditional DDPM.
//!
//! Same forward process and update rule as [`Ddpm`]; the reverse pass also
//! hands one class id per sample to the network. `labels = None` falls back
//! to the unconditional prediction.

use candle_core::{DType, Tensor};

use super::ddpm::Ddpm;
use crate::config::DdpmConfig;
use crate::context::ExecutionContext;
use crate::model::{Conditioning, DenoiserNetwork};
use crate::{Error, Result};

pub struct ConditionalDdpm<N> {
    ddpm: Ddpm<N>,
    nb_classes: usize,
}

impl<N: DenoiserNetwork> ConditionalDdpm<N> {
    pub fn new(
        network: N,
        cfg: &DdpmConfig,
        nb_classes: usize,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        if nb_classes == 0 {
            return Err(Error::config("nb_classes must be positive"));
        }
        Ok(Self {
            ddpm: Ddpm::new(network, cfg, ctx)?,
            nb_classes,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.ddpm.num_timesteps()
    }

    pub fn nb_classes(&self) -> usize {
        self.nb_classes
    }

    /// The underlying unconditional process.
    pub fn ddpm(&self) -> &Ddpm<N> {
        &self.ddpm
    }

    pub fn add_noise(&self, x0: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self.ddpm.add_noise(x0, noise, timesteps)
    }

    /// Noise predicted for `x_t`, steered by `labels` when present.
    pub fn reverse(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<Tensor> {
        if let Some(labels) = labels {
            self.check_labels(labels, x_t.dim(0)?)?;
        }
        self.ddpm
            .predict_noise(x_t, timesteps, Conditioning::from(labels))
    }

    pub fn step(&self, predicted_noise: &Tensor, t: usize, x_t: &Tensor) -> Result<Tensor> {
        self.ddpm.step(predicted_noise, t, x_t)
    }

    pub fn step_with_noise(
        &self,
        predicted_noise: &Tensor,
        t: usize,
        x_t: &Tensor,
        z: &Tensor,
    ) -> Result<Tensor> {
        self.ddpm.step_with_noise(predicted_noise, t, x_t, z)
    }

    fn check_labels(&self, labels: &Tensor, batch: usize) -> Result<()> {
        let flat = labels.flatten_all()?;
        if flat.dim(0)? != batch {
            return Err(Error::ShapeMismatch {
                what: "labels",
                expected: vec![batch],
                actual: labels.dims().to_vec(),
            });
        }
        let values = flat.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        if let Some(&label) = values
            .iter()
            .find(|&&l| l < 0 || l >= self.nb_classes as i64)
        {
            return Err(Error::LabelOutOfRange {
                label,
                nb_classes: self.nb_classes,
            });
        }
        Ok(())
    }
}
