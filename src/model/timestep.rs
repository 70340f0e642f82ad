//! Sinusoidal timestep embedding table.
//!
//! Position `t` maps to `[sin(t·f_0), …, sin(t·f_{h-1}), cos(t·f_0), …, cos(t·f_{h-1})]`
//! with `f_j = exp(-ln(10000) · j / h)` and `h = dim / 2`. The table is
//! computed once and never trained; lookups are a gather on the timestep ids.

use candle_core::{DType, Device, Tensor};

use crate::Result;

/// Frozen `[n_steps, dim]` embedding table.
#[derive(Debug, Clone)]
pub struct SinusoidalTable {
    table: Tensor,
}

impl SinusoidalTable {
    pub fn new(n_steps: usize, dim: usize, dtype: DType, dev: &Device) -> Result<Self> {
        let half = dim / 2;
        let max_period: f64 = 10000.0;

        let freqs: Vec<f64> = (0..half)
            .map(|j| (-(max_period.ln()) * j as f64 / half.max(1) as f64).exp())
            .collect();

        let mut values = Vec::with_capacity(n_steps * dim);
        for t in 0..n_steps {
            let t = t as f64;
            values.extend(freqs.iter().map(|f| (t * f).sin() as f32));
            values.extend(freqs.iter().map(|f| (t * f).cos() as f32));
            // Odd dims get a zero pad column.
            if dim % 2 == 1 {
                values.push(0.0);
            }
        }

        let table = Tensor::from_vec(values, (n_steps, dim), dev)?.to_dtype(dtype)?;
        Ok(Self { table })
    }

    pub fn n_steps(&self) -> usize {
        self.table.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.table.dims()[1]
    }

    /// `timesteps`: integer ids `[N]` or `[N, 1]` → `[N, dim]`.
    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let ids = timesteps.flatten_all()?.to_dtype(DType::U32)?;
        Ok(self.table.index_select(&ids, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape_and_origin() {
        let dev = Device::Cpu;
        let table = SinusoidalTable::new(1000, 100, DType::F32, &dev).unwrap();
        assert_eq!(table.n_steps(), 1000);
        assert_eq!(table.dim(), 100);

        // t = 0: all sines are 0, all cosines are 1.
        let t = Tensor::new(&[0u32], &dev).unwrap();
        let row: Vec<f32> = table.forward(&t).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(row[..50].iter().all(|v| v.abs() < 1e-6));
        assert!(row[50..].iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn distinct_timesteps_embed_differently() {
        let dev = Device::Cpu;
        let table = SinusoidalTable::new(100, 32, DType::F32, &dev).unwrap();
        let t = Tensor::new(&[[3u32], [70u32]], &dev).unwrap();
        let emb = table.forward(&t).unwrap();
        assert_eq!(emb.dims(), &[2, 32]);

        let diff: f32 = (emb.get(0).unwrap() - emb.get(1).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 0.1);
    }
}
