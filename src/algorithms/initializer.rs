use crate::error::{RecError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

pub fn uniform<R: Rng>(rng: &mut R, size: usize, low: f32, high: f32) -> Vec<f32> {
    (0..size).map(|_| rng.gen_range(low..high)).collect()
}

pub fn normal<R: Rng>(rng: &mut R, size: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..size)
        .map(|_| {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen();
            let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
            z0 * std_dev + mean
        })
        .collect()
}

pub fn xavier_uniform<R: Rng>(rng: &mut R, size: usize, fan: usize) -> Vec<f32> {
    let limit = (6.0 / fan.max(1) as f32).sqrt();
    uniform(rng, size, -limit, limit)
}

/// Starting values for embedding tables. Biases and accumulators always
/// start at zero; embeddings must not, or every factor receives the same
/// gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitializationMethod {
    /// Uniform in `±0.5 / dim`.
    ScaledUniform,
    XavierUniform,
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std_dev: f32 },
}

impl Default for InitializationMethod {
    fn default() -> Self {
        InitializationMethod::ScaledUniform
    }
}

impl InitializationMethod {
    pub fn validate(&self) -> Result<()> {
        match *self {
            InitializationMethod::Uniform { low, high } => {
                if !(low.is_finite() && high.is_finite() && low < high) {
                    return Err(RecError::hyperparameter(format!(
                        "uniform initialization needs finite low < high, got [{}, {})",
                        low, high
                    )));
                }
            }
            InitializationMethod::Normal { mean, std_dev } => {
                if !(mean.is_finite() && std_dev.is_finite() && std_dev > 0.0) {
                    return Err(RecError::hyperparameter(
                        "normal initialization needs a finite mean and std_dev > 0",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Fills a row-major `rows × dim` table.
    pub fn initialize<R: Rng>(&self, rng: &mut R, rows: usize, dim: usize) -> Vec<f32> {
        let size = rows * dim;
        match *self {
            InitializationMethod::ScaledUniform => {
                let limit = 0.5 / dim.max(1) as f32;
                uniform(rng, size, -limit, limit)
            }
            InitializationMethod::XavierUniform => xavier_uniform(rng, size, dim),
            InitializationMethod::Uniform { low, high } => uniform(rng, size, low, high),
            InitializationMethod::Normal { mean, std_dev } => normal(rng, size, mean, std_dev),
        }
    }
}
