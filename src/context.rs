//! Execution context threaded through process construction.

use candle_core::{DType, Device};

use crate::Result;

/// Device and floating dtype every tensor a process creates will live on.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub device: Device,
    pub dtype: DType,
}

impl ExecutionContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// `f32` on the CPU.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    /// `f32` on the given CUDA device, falling back to the CPU.
    pub fn cuda_if_available(ordinal: usize) -> Result<Self> {
        Ok(Self::new(Device::cuda_if_available(ordinal)?, DType::F32))
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}
