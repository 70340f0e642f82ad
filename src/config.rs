//! Configuration for the diffusion processes, the reference U-Net and training.
//!
//! Defaults match the reference MNIST experiments (28×28, single channel).
//! Every struct round-trips through JSON and exposes a `validate()` that
//! reports bad values as [`Error::Config`].

use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which experiment to run. Named in snake case on the command line and in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Experiment {
    Ddpm,
    DdpmConditional,
    ColdMedian,
    ColdKernel,
    ColdResolution,
    Score,
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}

/// Noise injected by a reverse diffusion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepVariance {
    /// σ_t² = β_t.
    #[default]
    Beta,
    /// σ_t² = β_t (1 - ᾱ_{t-1}) / (1 - ᾱ_t).
    Posterior,
}

/// Gaussian diffusion (plain and class-conditional).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdpmConfig {
    #[serde(default = "default_num_timesteps")]
    pub num_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default)]
    pub variance: StepVariance,
}

impl Default for DdpmConfig {
    fn default() -> Self {
        Self {
            num_timesteps: default_num_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            variance: StepVariance::default(),
        }
    }
}

impl DdpmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_timesteps == 0 {
            return Err(Error::config("num_timesteps must be positive"));
        }
        if !(self.beta_start > 0.0 && self.beta_start <= self.beta_end && self.beta_end < 1.0) {
            return Err(Error::config(format!(
                "beta range must satisfy 0 < beta_start <= beta_end < 1, got [{}, {}]",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }
}

/// Deterministic degradation operator for cold diffusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradationConfig {
    /// Median filter whose odd window widens by 2 per level: `k + 2·(t - 1)` at depth `t`.
    Median { kernel_size: usize },
    /// Depthwise convolution with a fixed odd square kernel, applied once per step.
    Convolution { kernel: Vec<Vec<f32>> },
    /// Block-average down to 1/2^t resolution and back up (nearest).
    SuperResolution,
}

impl DegradationConfig {
    /// 3×3 mean kernel.
    pub fn mean_kernel() -> Self {
        Self::Convolution {
            kernel: vec![vec![1.0 / 9.0; 3]; 3],
        }
    }

    /// 3×3 binomial (Gaussian) kernel.
    pub fn gaussian_kernel() -> Self {
        Self::Convolution {
            kernel: vec![
                vec![1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0],
                vec![2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0],
                vec![1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0],
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Median { kernel_size } => {
                if *kernel_size == 0 || kernel_size % 2 == 0 {
                    return Err(Error::config(format!(
                        "median kernel_size must be odd and positive, got {kernel_size}"
                    )));
                }
            }
            Self::Convolution { kernel } => {
                let k = kernel.len();
                if k == 0 || k % 2 == 0 || kernel.iter().any(|row| row.len() != k) {
                    return Err(Error::config(
                        "convolution kernel must be square with an odd side",
                    ));
                }
            }
            Self::SuperResolution => {}
        }
        Ok(())
    }
}

/// Cold diffusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdConfig {
    pub num_timesteps: usize,
    /// Depth to which real images are degraded before sampling restores them.
    pub num_timesteps_generate: usize,
    pub degradation: DegradationConfig,
}

impl ColdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_timesteps == 0 {
            return Err(Error::config("num_timesteps must be positive"));
        }
        if self.num_timesteps_generate == 0 || self.num_timesteps_generate > self.num_timesteps {
            return Err(Error::config(format!(
                "num_timesteps_generate must lie in [1, {}], got {}",
                self.num_timesteps, self.num_timesteps_generate
            )));
        }
        self.degradation.validate()
    }
}

/// Score matching and annealed Langevin sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreConfig {
    /// Number of noise levels.
    pub n_steps: usize,
    pub sigma_min: f64,
    pub sigma_max: f64,
    /// Langevin updates per noise level.
    pub annealed_step: usize,
    /// Step size at σ_min.
    pub eps: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            n_steps: 100,
            sigma_min: 0.005,
            sigma_max: 10.0,
            annealed_step: 100,
            eps: 1.5e-5,
        }
    }
}

impl ScoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_steps == 0 {
            return Err(Error::config("n_steps must be positive"));
        }
        if !(self.sigma_min > 0.0 && self.sigma_min < self.sigma_max) {
            return Err(Error::config(format!(
                "sigma range must satisfy 0 < sigma_min < sigma_max, got [{}, {}]",
                self.sigma_min, self.sigma_max
            )));
        }
        if self.eps <= 0.0 {
            return Err(Error::config("eps must be positive"));
        }
        Ok(())
    }
}

/// Reference U-Net.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UNetConfig {
    pub image_size: usize,
    pub in_channels: usize,
    /// Rows of the sinusoidal timestep table.
    pub n_steps: usize,
    pub time_emb_dim: usize,
    /// Adds a label embedding when set.
    pub nb_classes: Option<usize>,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            image_size: 28,
            in_channels: 1,
            n_steps: 1000,
            time_emb_dim: 100,
            nb_classes: None,
        }
    }
}

impl UNetConfig {
    pub fn validate(&self) -> Result<()> {
        // 28 → 14 → 7 → 3 → 7 only closes when size / 4 is odd.
        if self.image_size % 4 != 0 || (self.image_size / 4) % 2 != 1 {
            return Err(Error::config(format!(
                "image_size must be 4 times an odd number, got {}",
                self.image_size
            )));
        }
        if self.in_channels == 0 || self.n_steps == 0 || self.time_emb_dim == 0 {
            return Err(Error::config(
                "in_channels, n_steps and time_emb_dim must be positive",
            ));
        }
        if self.nb_classes == Some(0) {
            return Err(Error::config("nb_classes must be positive when set"));
        }
        Ok(())
    }
}

/// Optimiser and epoch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Log the epoch loss every `log_interval` epochs.
    pub log_interval: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 200,
            batch_size: 128,
            learning_rate: 1e-3,
            weight_decay: 0.01,
            log_interval: 1,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }
        if self.log_interval == 0 {
            return Err(Error::config("log_interval must be positive"));
        }
        Ok(())
    }
}

/// Process-specific part of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "process", rename_all = "snake_case")]
pub enum ProcessConfig {
    Ddpm(DdpmConfig),
    Conditional { ddpm: DdpmConfig, nb_classes: usize },
    Cold(ColdConfig),
    Score(ScoreConfig),
}

/// Everything needed to train and sample one experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment: Experiment,
    pub process: ProcessConfig,
    pub unet: UNetConfig,
    pub training: TrainingConfig,
    /// Number of images to generate.
    pub sample_size: usize,
    /// Timestep at which the sampling drivers capture a snapshot.
    pub snapshot_at: Option<usize>,
}

impl ExperimentConfig {
    /// Hyper-parameters of the reference run for `experiment`.
    pub fn preset(experiment: Experiment) -> Self {
        let training = |epochs| TrainingConfig {
            epochs,
            ..Default::default()
        };
        let cold = |num_timesteps, num_timesteps_generate, degradation| {
            ProcessConfig::Cold(ColdConfig {
                num_timesteps,
                num_timesteps_generate,
                degradation,
            })
        };

        let (process, training) = match experiment {
            Experiment::Ddpm => (ProcessConfig::Ddpm(DdpmConfig::default()), training(200)),
            Experiment::DdpmConditional => (
                ProcessConfig::Conditional {
                    ddpm: DdpmConfig::default(),
                    nb_classes: 10,
                },
                training(200),
            ),
            Experiment::ColdMedian => (
                cold(100, 100, DegradationConfig::Median { kernel_size: 3 }),
                training(100),
            ),
            Experiment::ColdKernel => (cold(30, 25, DegradationConfig::mean_kernel()), training(50)),
            Experiment::ColdResolution => (cold(8, 8, DegradationConfig::SuperResolution), training(50)),
            Experiment::Score => (
                ProcessConfig::Score(ScoreConfig::default()),
                TrainingConfig {
                    epochs: 300,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            ),
        };

        let nb_classes = match &process {
            ProcessConfig::Conditional { nb_classes, .. } => Some(*nb_classes),
            _ => None,
        };

        Self {
            experiment,
            process,
            unet: UNetConfig {
                nb_classes,
                ..Default::default()
            },
            training,
            sample_size: 100,
            snapshot_at: Some(500),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.unet.validate()?;
        self.training.validate()?;

        // Highest timestep / noise-level id the network will be asked to embed.
        let max_index = match &self.process {
            ProcessConfig::Ddpm(ddpm) => {
                ddpm.validate()?;
                ddpm.num_timesteps - 1
            }
            ProcessConfig::Conditional { ddpm, nb_classes } => {
                ddpm.validate()?;
                if self.unet.nb_classes != Some(*nb_classes) {
                    return Err(Error::config(format!(
                        "conditional process has {nb_classes} classes but the network has {:?}",
                        self.unet.nb_classes
                    )));
                }
                ddpm.num_timesteps - 1
            }
            ProcessConfig::Cold(cold) => {
                cold.validate()?;
                cold.num_timesteps
            }
            ProcessConfig::Score(score) => {
                score.validate()?;
                score.n_steps - 1
            }
        };
        if max_index >= self.unet.n_steps {
            return Err(Error::config(format!(
                "network embeds {} timesteps but the process reaches index {max_index}",
                self.unet.n_steps
            )));
        }
        Ok(())
    }
}

fn default_num_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    1e-4
}

fn default_beta_end() -> f64 {
    0.02
}
