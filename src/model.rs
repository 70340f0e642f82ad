//! Denoiser networks.
//!
//! Every process talks to its network through [`DenoiserNetwork`]: an image
//! batch `[N, C, H, W]`, an integer timestep (or noise-level) tensor `[N]`,
//! and optional class labels. The output has the same shape as the input and
//! is interpreted by the process (noise for DDPM, a clean image for cold
//! diffusion, a score for score matching).
//!
//! ## Components
//!
//! - [`timestep`]: frozen sinusoidal timestep table
//! - [`unet`]: reference U-Net for 28×28 images, optionally label-conditioned

pub mod timestep;
pub mod unet;

use candle_core::Tensor;

use crate::Result;

/// How a forward pass is conditioned.
#[derive(Debug, Clone, Copy, Default)]
pub enum Conditioning<'a> {
    #[default]
    Unconditional,
    /// One class id per sample, `[N]`.
    Conditional(&'a Tensor),
}

impl<'a> Conditioning<'a> {
    pub fn labels(&self) -> Option<&'a Tensor> {
        match self {
            Conditioning::Unconditional => None,
            Conditioning::Conditional(labels) => Some(labels),
        }
    }
}

impl<'a> From<Option<&'a Tensor>> for Conditioning<'a> {
    fn from(labels: Option<&'a Tensor>) -> Self {
        match labels {
            Some(labels) => Conditioning::Conditional(labels),
            None => Conditioning::Unconditional,
        }
    }
}

/// Image-to-image regressor driven by a timestep embedding.
pub trait DenoiserNetwork {
    fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        conditioning: Conditioning<'_>,
    ) -> Result<Tensor>;
}

impl<N: DenoiserNetwork + ?Sized> DenoiserNetwork for &N {
    fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        conditioning: Conditioning<'_>,
    ) -> Result<Tensor> {
        (**self).forward(xs, timesteps, conditioning)
    }
}

impl<N: DenoiserNetwork + ?Sized> DenoiserNetwork for Box<N> {
    fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        conditioning: Conditioning<'_>,
    ) -> Result<Tensor> {
        (**self).forward(xs, timesteps, conditioning)
    }
}
