//! Reference U-Net for 28×28 single-channel images.
//!
//! Three down stages, a bottleneck and three up stages with skip
//! concatenation:
//!
//! ```text
//! x [C,28,28] ─ b1 ─┬─ down1 ─ b2 ─┬─ down2 ─ b3 ─┬─ down3 ─ b_mid ─ up1 ─┐
//!                   │              │              └──────── cat ─────────┴─ b4 ─ up2 ─┐
//!                   │              └──────────────────────── cat ─────────────────────┴─ b5 ─ up3 ─┐
//!                   └──────────────────────────────────────── cat ─────────────────────────────────┴─ b_out ─ conv_out
//! ```
//!
//! Each stage is three [`UNetBlock`]s and receives the timestep embedding
//! (plus the label embedding when conditioned) projected to its input
//! channel count and broadcast over the spatial dims.

use candle_core::{DType, Module, Tensor};
use candle_nn::{self as nn, Conv2dConfig, ConvTranspose2dConfig, VarBuilder};

use super::timestep::SinusoidalTable;
use super::{Conditioning, DenoiserNetwork};
use crate::config::UNetConfig;
use crate::{Error, Result};

/// LayerNorm over the whole `(C, H, W)` feature map of each sample.
#[derive(Debug, Clone)]
struct SpatialLayerNorm {
    norm: nn::LayerNorm,
}

impl SpatialLayerNorm {
    fn new(shape: (usize, usize, usize), vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(shape, "weight", nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(shape, "bias", nn::Init::Const(0.0))?;
        let norm = nn::LayerNorm::new(weight.flatten_all()?, bias.flatten_all()?, 1e-5);
        Ok(Self { norm })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(&xs.flatten_from(1)?)?;
        Ok(normed.reshape(xs.shape())?)
    }
}

/// `[LayerNorm] → conv3×3 → SiLU → conv3×3 → SiLU`.
#[derive(Debug, Clone)]
pub struct UNetBlock {
    norm: Option<SpatialLayerNorm>,
    conv1: nn::Conv2d,
    conv2: nn::Conv2d,
}

impl UNetBlock {
    fn new(
        in_c: usize,
        out_c: usize,
        size: usize,
        normalize: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg3x3 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let norm = if normalize {
            Some(SpatialLayerNorm::new((in_c, size, size), vb.pp("ln"))?)
        } else {
            None
        };
        let conv1 = nn::conv2d(in_c, out_c, 3, cfg3x3, vb.pp("conv1"))?;
        let conv2 = nn::conv2d(out_c, out_c, 3, cfg3x3, vb.pp("conv2"))?;
        Ok(Self { norm, conv1, conv2 })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = match &self.norm {
            Some(norm) => norm.forward(xs)?,
            None => xs.clone(),
        };
        Ok(out.apply(&self.conv1)?.silu()?.apply(&self.conv2)?.silu()?)
    }
}

/// Three blocks at one resolution.
#[derive(Debug, Clone)]
struct Stage {
    blocks: Vec<UNetBlock>,
}

impl Stage {
    /// `channels`: `[c0, c1, c2, c3]`, block `i` maps `c_i → c_{i+1}`.
    fn new(channels: [usize; 4], size: usize, normalize_last: bool, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..3)
            .map(|i| {
                let normalize = i < 2 || normalize_last;
                UNetBlock::new(channels[i], channels[i + 1], size, normalize, vb.pp(i))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut out = xs.clone();
        for block in &self.blocks {
            out = block.forward(&out)?;
        }
        Ok(out)
    }
}

/// `Linear → SiLU → Linear` projection of the embedding to a stage's channels.
#[derive(Debug, Clone)]
struct TimeMlp {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimeMlp {
    fn new(dim_in: usize, dim_out: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = nn::linear(dim_in, dim_out, vb.pp("linear_1"))?;
        let linear_2 = nn::linear(dim_out, dim_out, vb.pp("linear_2"))?;
        Ok(Self { linear_1, linear_2 })
    }

    /// `emb [N, D]` → `[N, dim_out, 1, 1]`.
    fn forward(&self, emb: &Tensor) -> Result<Tensor> {
        let out = emb.apply(&self.linear_1)?.silu()?.apply(&self.linear_2)?;
        let (n, c) = out.dims2()?;
        Ok(out.reshape((n, c, 1, 1))?)
    }
}

/// The reference U-Net.
#[derive(Debug, Clone)]
pub struct UNet {
    time_embed: SinusoidalTable,
    label_embed: Option<nn::Embedding>,

    te1: TimeMlp,
    b1: Stage,
    down1: nn::Conv2d,

    te2: TimeMlp,
    b2: Stage,
    down2: nn::Conv2d,

    te3: TimeMlp,
    b3: Stage,
    down3_a: nn::Conv2d,
    down3_b: nn::Conv2d,

    te_mid: TimeMlp,
    b_mid: Stage,

    up1_a: nn::ConvTranspose2d,
    up1_b: nn::ConvTranspose2d,
    te4: TimeMlp,
    b4: Stage,

    up2: nn::ConvTranspose2d,
    te5: TimeMlp,
    b5: Stage,

    up3: nn::ConvTranspose2d,
    te_out: TimeMlp,
    b_out: Stage,

    conv_out: nn::Conv2d,
}

impl UNet {
    pub fn new(cfg: &UNetConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;

        let c = cfg.in_channels;
        let d = cfg.time_emb_dim;
        let s1 = cfg.image_size;
        let s2 = s1 / 2;
        let s3 = s2 / 2;
        let s_mid = (s3 - 1) / 2;

        let time_embed = SinusoidalTable::new(cfg.n_steps, d, vb.dtype(), vb.device())?;
        let label_embed = match cfg.nb_classes {
            Some(nb_classes) => Some(nn::embedding(nb_classes, d, vb.pp("label_emb"))?),
            None => None,
        };

        let down = Conv2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let up = ConvTranspose2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };

        Ok(Self {
            time_embed,
            label_embed,

            te1: TimeMlp::new(d, c, vb.pp("te1"))?,
            b1: Stage::new([c, 10, 10, 10], s1, true, vb.pp("b1"))?,
            down1: nn::conv2d(10, 10, 4, down, vb.pp("down1"))?,

            te2: TimeMlp::new(d, 10, vb.pp("te2"))?,
            b2: Stage::new([10, 20, 40, 40], s2, true, vb.pp("b2"))?,
            down2: nn::conv2d(40, 40, 4, down, vb.pp("down2"))?,

            te3: TimeMlp::new(d, 40, vb.pp("te3"))?,
            b3: Stage::new([40, 80, 160, 160], s3, true, vb.pp("b3"))?,
            down3_a: nn::conv2d(160, 160, 2, Default::default(), vb.pp("down3.0"))?,
            down3_b: nn::conv2d(160, 160, 4, down, vb.pp("down3.2"))?,

            te_mid: TimeMlp::new(d, 160, vb.pp("te_mid"))?,
            b_mid: Stage::new([160, 160, 160, 160], s_mid, true, vb.pp("b_mid"))?,

            up1_a: nn::conv_transpose2d(160, 160, 4, up, vb.pp("up1.0"))?,
            up1_b: nn::conv_transpose2d(160, 160, 2, Default::default(), vb.pp("up1.2"))?,
            te4: TimeMlp::new(d, 320, vb.pp("te4"))?,
            b4: Stage::new([320, 160, 80, 80], s3, true, vb.pp("b4"))?,

            up2: nn::conv_transpose2d(80, 40, 4, up, vb.pp("up2"))?,
            te5: TimeMlp::new(d, 80, vb.pp("te5"))?,
            b5: Stage::new([80, 40, 20, 20], s2, true, vb.pp("b5"))?,

            up3: nn::conv_transpose2d(20, 10, 4, up, vb.pp("up3"))?,
            te_out: TimeMlp::new(d, 20, vb.pp("te_out"))?,
            b_out: Stage::new([20, 20, 10, 10], s1, false, vb.pp("b_out"))?,

            conv_out: nn::conv2d(10, c, 3, same, vb.pp("conv_out"))?,
        })
    }

    pub fn is_conditional(&self) -> bool {
        self.label_embed.is_some()
    }

    /// Timestep embedding, plus the label embedding when conditioned.
    fn embed(&self, timesteps: &Tensor, conditioning: Conditioning<'_>) -> Result<Tensor> {
        let temb = self.time_embed.forward(timesteps)?;
        match conditioning {
            Conditioning::Unconditional => Ok(temb),
            Conditioning::Conditional(labels) => {
                let label_embed = self.label_embed.as_ref().ok_or_else(|| {
                    Error::config("label conditioning requested on a network built without nb_classes")
                })?;
                let ids = labels.flatten_all()?.to_dtype(DType::U32)?;
                if ids.dim(0)? != temb.dim(0)? {
                    return Err(Error::ShapeMismatch {
                        what: "labels",
                        expected: vec![temb.dim(0)?],
                        actual: labels.dims().to_vec(),
                    });
                }
                Ok((temb + ids.apply(label_embed)?)?)
            }
        }
    }
}

impl DenoiserNetwork for UNet {
    fn forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        conditioning: Conditioning<'_>,
    ) -> Result<Tensor> {
        let n = xs.dim(0)?;
        let emb = self.embed(timesteps, conditioning)?;
        if emb.dim(0)? != n {
            return Err(Error::ShapeMismatch {
                what: "timesteps",
                expected: vec![n],
                actual: timesteps.dims().to_vec(),
            });
        }

        let out1 = self.b1.forward(&xs.broadcast_add(&self.te1.forward(&emb)?)?)?;
        let out2 = self
            .b2
            .forward(&out1.apply(&self.down1)?.broadcast_add(&self.te2.forward(&emb)?)?)?;
        let out3 = self
            .b3
            .forward(&out2.apply(&self.down2)?.broadcast_add(&self.te3.forward(&emb)?)?)?;

        let down3 = out3.apply(&self.down3_a)?.silu()?.apply(&self.down3_b)?;
        let out_mid = self
            .b_mid
            .forward(&down3.broadcast_add(&self.te_mid.forward(&emb)?)?)?;

        let up1 = out_mid.apply(&self.up1_a)?.silu()?.apply(&self.up1_b)?;
        let out4 = Tensor::cat(&[&out3, &up1], 1)?;
        let out4 = self
            .b4
            .forward(&out4.broadcast_add(&self.te4.forward(&emb)?)?)?;

        let out5 = Tensor::cat(&[&out2, &out4.apply(&self.up2)?], 1)?;
        let out5 = self
            .b5
            .forward(&out5.broadcast_add(&self.te5.forward(&emb)?)?)?;

        let out = Tensor::cat(&[&out1, &out5.apply(&self.up3)?], 1)?;
        let out = self
            .b_out
            .forward(&out.broadcast_add(&self.te_out.forward(&emb)?)?)?;

        Ok(out.apply(&self.conv_out)?)
    }
}
