//! Image diffusion processes in pure Rust.
//!
//! A candle-based implementation of four ways to corrupt an image step by
//! step and learn to undo it: Gaussian diffusion (DDPM), class-conditional
//! DDPM, cold diffusion with deterministic degradations, and multi-level
//! score matching sampled with annealed Langevin dynamics.
//!
//! ## Architecture
//!
//! ```text
//! schedule ─→ process (ddpm / conditional / cold / score) ─→ sampling
//!                 │                                  ↑
//!                 └──── DenoiserNetwork (UNet) ──────┘
//!                                  ↑
//!                               training
//! ```
//!
//! ## Modules
//!
//! - [`schedule`]: β / ᾱ and σ schedules
//! - [`process`]: forward corruption and reverse updates
//! - [`model`]: network interface and the reference U-Net
//! - [`sampling`]: end-to-end generation loops
//! - [`training`]: AdamW epoch loops
//! - [`config`]: experiment presets and JSON configuration

pub mod config;
pub mod context;
pub mod model;
pub mod process;
pub mod sampling;
pub mod schedule;
pub mod training;

mod error;

pub use error::{Error, Result};
