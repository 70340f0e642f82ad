//! Deterministic degradation operators.
//!
//! A degradation maps a clean batch to one level `D_t(x_0)` for every depth
//! `t ≥ 0`, with `D_0 = id`. Levels are produced one at a time:
//! ```text
//! D_t(x_0) = S_t(x_0, D_{t-1}(x_0))
//! ```
//! Chained operators (convolution, super-resolution) apply a per-step
//! operator to the previous level. The median filter reads only the clean
//! image and widens its window with `t`.
//!
//! All operators act on `[N, C, H, W]` batches channel by channel and keep
//! the spatial size. Borders are handled by replicating the edge pixels.

use candle_core::{D, DType, Device, Tensor};

use crate::config::DegradationConfig;
use crate::Result;

pub trait Degradation {
    /// `D_step(x0)` given `prev = D_{step-1}(x0)`, `step ≥ 1`.
    fn degrade_step(&self, x0: &Tensor, prev: &Tensor, step: usize) -> Result<Tensor>;

    /// `D_t(xs)`; `t = 0` returns the input unchanged.
    fn degrade(&self, xs: &Tensor, t: usize) -> Result<Tensor> {
        let mut out = xs.clone();
        for step in 1..=t {
            out = self.degrade_step(xs, &out, step)?;
        }
        Ok(out)
    }

    fn name(&self) -> &'static str;
}

impl<T: Degradation + ?Sized> Degradation for Box<T> {
    fn degrade_step(&self, x0: &Tensor, prev: &Tensor, step: usize) -> Result<Tensor> {
        (**self).degrade_step(x0, prev, step)
    }

    fn degrade(&self, xs: &Tensor, t: usize) -> Result<Tensor> {
        (**self).degrade(xs, t)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Build the operator described by `cfg`.
pub fn from_config(cfg: &DegradationConfig) -> Result<Box<dyn Degradation + Send + Sync>> {
    let op: Box<dyn Degradation + Send + Sync> = match cfg {
        DegradationConfig::Median { kernel_size } => Box::new(MedianBlur::new(*kernel_size)?),
        DegradationConfig::Convolution { kernel } => Box::new(ConvolutionBlur::new(kernel)?),
        DegradationConfig::SuperResolution => Box::new(SuperResolution),
    };
    Ok(op)
}

fn pad_replicate(xs: &Tensor, radius: usize) -> Result<Tensor> {
    Ok(xs
        .pad_with_same(2, radius, radius)?
        .pad_with_same(3, radius, radius)?)
}

/// Median filter whose window widens with depth: `D_t` is a single median of
/// the clean image over `k_t × k_t` windows, `k_t = k + 2·(t - 1)`.
#[derive(Debug, Clone)]
pub struct MedianBlur {
    kernel_size: usize,
}

impl MedianBlur {
    pub fn new(kernel_size: usize) -> Result<Self> {
        DegradationConfig::Median { kernel_size }.validate()?;
        Ok(Self { kernel_size })
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Window side used at depth `t ≥ 1`.
    pub fn window(&self, t: usize) -> usize {
        self.kernel_size + 2 * t.saturating_sub(1)
    }
}

impl Degradation for MedianBlur {
    fn degrade_step(&self, x0: &Tensor, _prev: &Tensor, step: usize) -> Result<Tensor> {
        median(x0, self.window(step))
    }

    fn degrade(&self, xs: &Tensor, t: usize) -> Result<Tensor> {
        if t == 0 {
            return Ok(xs.clone());
        }
        median(xs, self.window(t))
    }

    fn name(&self) -> &'static str {
        "median"
    }
}

fn median(xs: &Tensor, k: usize) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    if h * w == 0 {
        return Ok(xs.clone());
    }
    if k * k <= h * w {
        windowed_median(xs, k)
    } else {
        counted_median(xs, k)
    }
}

/// Median over every pixel's `k × k` neighbourhood, stacked along a new axis.
fn windowed_median(xs: &Tensor, k: usize) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    let padded = pad_replicate(xs, k / 2)?;

    let mut windows = Vec::with_capacity(k * k);
    for dy in 0..k {
        for dx in 0..k {
            windows.push(padded.narrow(2, dy, h)?.narrow(3, dx, w)?);
        }
    }
    let stacked = Tensor::stack(&windows, 4)?.contiguous()?;
    let (sorted, _) = stacked.sort_last_dim(true)?;
    Ok(sorted.narrow(D::Minus1, k * k / 2, 1)?.squeeze(D::Minus1)?)
}

/// `counts[centre * len + index]`: how many offsets in `-radius..=radius`
/// land on `index` once `centre + offset` is clamped to `[0, len)`.
fn clamped_counts(len: usize, radius: usize) -> Vec<u64> {
    let mut counts = vec![0u64; len * len];
    let last = len as isize - 1;
    let radius = radius as isize;
    for centre in 0..len {
        for offset in -radius..=radius {
            let index = (centre as isize + offset).clamp(0, last) as usize;
            counts[centre * len + index] += 1;
        }
    }
    counts
}

/// Same result as [`windowed_median`] for windows wider than the image.
///
/// A replicate-padded window holds each pixel `(a, b)` exactly
/// `rows[i][a] · cols[j][b]` times, so the median is found by walking the
/// plane's pixels in sorted order until the running count passes half the
/// window. Memory stays at one plane whatever the window size.
fn counted_median(xs: &Tensor, k: usize) -> Result<Tensor> {
    let (n, c, h, w) = xs.dims4()?;
    let rows = clamped_counts(h, k / 2);
    let cols = clamped_counts(w, k / 2);
    let half = (k * k / 2) as u64;

    let values = xs
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;
    let mut out = Vec::with_capacity(values.len());
    let mut order: Vec<usize> = Vec::with_capacity(h * w);
    for plane in values.chunks(h * w) {
        order.clear();
        order.extend(0..h * w);
        order.sort_by(|&p, &q| plane[p].total_cmp(&plane[q]));
        for i in 0..h {
            for j in 0..w {
                let mut seen = 0u64;
                let mut value = plane[order[h * w - 1]];
                for &p in &order {
                    seen += rows[i * h + p / w] * cols[j * w + p % w];
                    if seen > half {
                        value = plane[p];
                        break;
                    }
                }
                out.push(value);
            }
        }
    }
    Ok(Tensor::from_vec(out, (n, c, h, w), xs.device())?.to_dtype(xs.dtype())?)
}

/// Depthwise correlation with a fixed square kernel, same kernel at every step.
#[derive(Debug, Clone)]
pub struct ConvolutionBlur {
    /// `[1, 1, k, k]`, f32 on the CPU until a batch asks for another device.
    kernel: Tensor,
    size: usize,
}

impl ConvolutionBlur {
    pub fn new(kernel: &[Vec<f32>]) -> Result<Self> {
        DegradationConfig::Convolution {
            kernel: kernel.to_vec(),
        }
        .validate()?;
        let size = kernel.len();
        let weights: Vec<f32> = kernel.iter().flatten().copied().collect();
        Ok(Self {
            kernel: Tensor::from_vec(weights, (1, 1, size, size), &Device::Cpu)?,
            size,
        })
    }

    pub fn kernel_size(&self) -> usize {
        self.size
    }

    pub fn kernel(&self) -> &Tensor {
        &self.kernel
    }
}

impl Degradation for ConvolutionBlur {
    fn degrade_step(&self, _x0: &Tensor, prev: &Tensor, _step: usize) -> Result<Tensor> {
        let (_, c, _, _) = prev.dims4()?;
        let kernel = self
            .kernel
            .to_device(prev.device())?
            .to_dtype(prev.dtype())?
            .repeat((c, 1, 1, 1))?;
        let padded = pad_replicate(prev, self.size / 2)?;
        Ok(padded.conv2d(&kernel, 0, 1, 1, c)?)
    }

    fn name(&self) -> &'static str {
        "convolution"
    }
}

/// Resolution loss: step `s` averages aligned blocks of `2^s × 2^s` pixels and
/// upsamples back by repetition. Block partitions are nested, so `D_t` is the
/// single block average at size `2^t`. Blocks are clipped at the image edge and
/// once `2^t` exceeds a side the whole axis collapses to its mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuperResolution;

impl SuperResolution {
    fn block_size(step: usize, len: usize) -> usize {
        let mut block = 1usize;
        for _ in 0..step {
            if block >= len {
                break;
            }
            block *= 2;
        }
        block.min(len.max(1))
    }
}

/// Symmetric `[len, len]` matrix averaging inside aligned blocks of `block`.
fn block_average_matrix(len: usize, block: usize, like: &Tensor) -> Result<Tensor> {
    let mut values = vec![0f32; len * len];
    for start in (0..len).step_by(block) {
        let end = (start + block).min(len);
        let weight = 1.0 / (end - start) as f32;
        for i in start..end {
            for j in start..end {
                values[i * len + j] = weight;
            }
        }
    }
    Ok(Tensor::from_vec(values, (len, len), like.device())?.to_dtype(like.dtype())?)
}

fn block_average(xs: &Tensor, block_h: usize, block_w: usize) -> Result<Tensor> {
    let (n, c, h, w) = xs.dims4()?;
    let mh = block_average_matrix(h, block_h, xs)?;
    let mw = block_average_matrix(w, block_w, xs)?;

    let rows = xs.contiguous()?.reshape((n * c * h, w))?.matmul(&mw)?;
    let cols = rows
        .reshape((n * c, h, w))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((n * c * w, h))?
        .matmul(&mh)?;
    Ok(cols
        .reshape((n * c, w, h))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((n, c, h, w))?)
}

impl Degradation for SuperResolution {
    fn degrade_step(&self, _x0: &Tensor, prev: &Tensor, step: usize) -> Result<Tensor> {
        let (_, _, h, w) = prev.dims4()?;
        block_average(prev, Self::block_size(step, h), Self::block_size(step, w))
    }

    fn name(&self) -> &'static str {
        "super_resolution"
    }
}
