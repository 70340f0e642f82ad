//! Image diffusion CLI: train a process and generate images with it.
//!
//! Images are read from and written to `.npy` files of shape `[N, C, H, W]`.
//! Network weights are kept in a safetensors file: loaded when it exists,
//! written back after training.
//!
//! # Output
//!
//! Writes `samples.npy` (and `snapshot.npy` when a snapshot was captured)
//! into the directory given by --output, then prints a one-line JSON
//! summary to stdout:
//!
//! ```json
//! {"experiment":"ddpm","samples":"out/samples.npy","shape":[100,1,28,28],"final_loss":0.031}
//! ```

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use image_diffusion_rs::{
    config::{Experiment, ExperimentConfig, ProcessConfig},
    context::ExecutionContext,
    model::unet::UNet,
    process::{
        cold::{ColdDiffusion, RestoreStrategy},
        conditional::ConditionalDdpm,
        ddpm::Ddpm,
        degradation,
        langevin::AnnealedLangevinDynamic,
        score::ScoreModel,
    },
    sampling::{self, GeneratedImages},
    training::Trainer,
};

#[derive(Parser, Debug)]
#[command(
    name = "image-diffusion",
    about = "Train and sample image diffusion processes",
    long_about = "Train a DDPM, conditional DDPM, cold diffusion or score model on an\n\
                  .npy image set and generate new images with it.\n\
                  Generated batches are written to --output as .npy files."
)]
struct Args {
    /// Experiment preset. Optional with --config, which names its own.
    #[arg(long, short = 'e', value_enum, required_unless_present = "config")]
    experiment: Option<Experiment>,

    /// JSON experiment configuration. Defaults to the experiment's preset.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training images, `[N, C, H, W]` `.npy`. Cold diffusion also restores these.
    #[arg(long, short = 'd')]
    data: Option<PathBuf>,

    /// Class labels `[N]` `.npy` for conditional training.
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Network weights (safetensors).
    #[arg(long, short = 'w')]
    weights: Option<PathBuf>,

    /// Override the number of training epochs (0 skips training).
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the number of generated images.
    #[arg(long, short = 'n')]
    samples: Option<usize>,

    /// Cold diffusion restoration: 1/naive or 2/improved.
    #[arg(long, default_value = "improved")]
    strategy: RestoreStrategy,

    /// Seed for shuffling and timestep draws.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Output directory.
    #[arg(long, short = 'o', default_value = "output")]
    output: PathBuf,
}

fn load_npy(path: &Path, ctx: &ExecutionContext) -> anyhow::Result<Tensor> {
    let tensor = Tensor::read_npy(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    Ok(tensor.to_device(&ctx.device)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match (&args.config, args.experiment) {
        (Some(path), _) => ExperimentConfig::from_file(path)?,
        (None, Some(experiment)) => ExperimentConfig::preset(experiment),
        (None, None) => anyhow::bail!("pass --experiment or --config"),
    };
    if let Some(experiment) = args.experiment
        && experiment != cfg.experiment
    {
        anyhow::bail!(
            "--experiment {experiment} disagrees with the configuration's {}",
            cfg.experiment
        );
    }
    if let Some(epochs) = args.epochs {
        cfg.training.epochs = epochs;
    }
    if let Some(samples) = args.samples {
        cfg.sample_size = samples;
    }
    if let Some(seed) = args.seed {
        cfg.training.seed = seed;
    }
    cfg.validate()?;

    std::fs::create_dir_all(&args.output)?;

    let ctx = ExecutionContext::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", ctx.device);
    tracing::info!("Experiment: {}", cfg.experiment);

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, ctx.dtype, &ctx.device);
    let unet = UNet::new(&cfg.unet, vb)?;
    if let Some(weights) = &args.weights
        && weights.exists()
    {
        tracing::info!("Loading weights from {}", weights.display());
        varmap.load(weights)?;
    }

    let images = match &args.data {
        Some(path) => Some(load_npy(path, &ctx)?.to_dtype(ctx.dtype)?),
        None => None,
    };
    let train_on = images.as_ref().filter(|_| cfg.training.epochs > 0);
    let mut trainer = Trainer::new(&varmap, &cfg.training)?;

    let image_shape = (cfg.unet.in_channels, cfg.unet.image_size, cfg.unet.image_size);
    let mut losses = Vec::new();

    let generated = match &cfg.process {
        ProcessConfig::Ddpm(ddpm_cfg) => {
            let ddpm = Ddpm::new(&unet, ddpm_cfg, &ctx)?;
            if let Some(images) = train_on {
                losses = trainer.train_ddpm(&ddpm, images)?;
            }
            sampling::generate_image(&ddpm, cfg.sample_size, image_shape, cfg.snapshot_at, &ctx)?
        }
        ProcessConfig::Conditional { ddpm, nb_classes } => {
            let process = ConditionalDdpm::new(&unet, ddpm, *nb_classes, &ctx)?;
            if let Some(images) = train_on {
                let Some(path) = &args.labels else {
                    anyhow::bail!("conditional training needs --labels");
                };
                let labels = load_npy(path, &ctx)?.to_dtype(DType::U32)?;
                losses = trainer.train_conditional(&process, images, &labels)?;
            }
            // Cycle through the classes: 0, 1, …, nb_classes-1, 0, 1, …
            let labels: Vec<u32> = (0..cfg.sample_size)
                .map(|i| (i % nb_classes) as u32)
                .collect();
            let labels = Tensor::from_vec(labels, cfg.sample_size, &ctx.device)?;
            sampling::generate_image_conditional(
                &process,
                Some(&labels),
                cfg.sample_size,
                image_shape,
                cfg.snapshot_at,
                &ctx,
            )?
        }
        ProcessConfig::Cold(cold_cfg) => {
            let op = degradation::from_config(&cold_cfg.degradation)?;
            let cold = ColdDiffusion::new(&unet, op, cold_cfg.num_timesteps)?;
            let Some(images) = &images else {
                anyhow::bail!("cold diffusion needs --data: it restores degraded real images");
            };
            if let Some(images) = train_on {
                losses = trainer.train_cold(&cold, images)?;
            }
            let count = cfg.sample_size.min(images.dim(0)?);
            let restored = sampling::generate_image_cold(
                &cold,
                &images.narrow(0, 0, count)?,
                cold_cfg.num_timesteps_generate,
                args.strategy,
            )?;
            GeneratedImages {
                samples: restored,
                snapshot: None,
            }
        }
        ProcessConfig::Score(score_cfg) => {
            let model = ScoreModel::new(&unet, score_cfg, &ctx)?;
            if let Some(images) = train_on {
                losses = trainer.train_score(&model, images)?;
            }
            let sampler = AnnealedLangevinDynamic::from_config(&model, score_cfg, image_shape, &ctx)?;
            let samples = sampler.sampling(cfg.sample_size, true)?;
            let Some(samples) = samples.into_iter().next_back() else {
                anyhow::bail!("Langevin sampler produced no batch");
            };
            GeneratedImages {
                samples,
                snapshot: None,
            }
        }
    };

    if let Some(weights) = &args.weights
        && !losses.is_empty()
    {
        varmap.save(weights)?;
        tracing::info!("Saved weights to {}", weights.display());
    }

    let samples_path = args.output.join("samples.npy");
    generated.samples.write_npy(&samples_path)?;
    if let Some(snapshot) = &generated.snapshot {
        snapshot.write_npy(args.output.join("snapshot.npy"))?;
    }

    let summary = serde_json::json!({
        "experiment": cfg.experiment.to_string(),
        "samples": samples_path.display().to_string(),
        "shape": generated.samples.dims(),
        "final_loss": losses.last(),
    });
    println!("{summary}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn experiment_is_optional_with_a_config() {
        let args = Args::try_parse_from(["image-diffusion", "-e", "ddpm_conditional"]).unwrap();
        assert_eq!(args.experiment, Some(Experiment::DdpmConditional));

        let args = Args::try_parse_from(["image-diffusion", "--config", "run.json"]).unwrap();
        assert_eq!(args.experiment, None);
        assert_eq!(args.config, Some(PathBuf::from("run.json")));

        assert!(Args::try_parse_from(["image-diffusion"]).is_err());
        assert!(Args::try_parse_from(["image-diffusion", "-e", "cold-median"]).is_err());
    }
}
