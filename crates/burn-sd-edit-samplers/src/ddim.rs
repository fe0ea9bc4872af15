//! DDIM (Denoising Diffusion Implicit Models) Sampler
//!
//! Implements the deterministic (eta = 0) reverse step:
//!
//! ```text
//! pred_x0 = (x_t - sqrt(1 - a_t) * e) / sqrt(a_t)
//! x_prev  = sqrt(1 - a_prev) * e + sqrt(a_prev) * pred_x0
//! ```

use burn::prelude::*;

use crate::scheduler::{NoiseSchedule, ScheduleError, StepAlphas, MIN_ALPHA};

/// DDIM sampler configuration
#[derive(Debug, Clone)]
pub struct DdimConfig {
    /// Number of inference steps
    pub num_inference_steps: usize,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 50,
        }
    }
}

/// DDIM Sampler
///
/// Walks the strided timestep sequence from the noisiest step down to
/// timestep 1. Step index 0 is the highest noise level.
#[derive(Debug, Clone)]
pub struct DdimSampler {
    /// Per-step alphas, noisiest first
    steps: Vec<StepAlphas>,
}

impl DdimSampler {
    /// Create a new DDIM sampler
    pub fn new(schedule: &NoiseSchedule, config: DdimConfig) -> Result<Self, ScheduleError> {
        let mut steps = schedule.step_alphas(config.num_inference_steps)?;
        steps.reverse();
        Ok(Self { steps })
    }

    /// Timesteps in sampling order (descending)
    pub fn timesteps(&self) -> Vec<usize> {
        self.steps.iter().map(|s| s.timestep).collect()
    }

    /// Number of steps actually taken
    ///
    /// May exceed the requested count when 1000 is not a multiple of it,
    /// since the stride is `1000 / num_inference_steps`.
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    /// Alphas for a step index (0 = highest noise)
    pub fn alphas(&self, step_index: usize) -> Option<StepAlphas> {
        self.steps.get(step_index).copied()
    }

    pub fn steps(&self) -> &[StepAlphas] {
        &self.steps
    }

    /// Perform one DDIM step
    ///
    /// # Arguments
    /// * `latent` - Current noisy latent [batch, channels, height, width]
    /// * `noise_pred` - Predicted noise [batch, channels, height, width]
    /// * `step_index` - Current step index (0 = highest noise)
    pub fn step<B: Backend>(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step_index: usize,
    ) -> Result<Tensor<B, 4>, ScheduleError> {
        let alphas = self
            .steps
            .get(step_index)
            .ok_or(ScheduleError::StepOutOfRange {
                index: step_index,
                steps: self.steps.len(),
            })?;
        ddim_step(latent, noise_pred, alphas)
    }
}

/// Deterministic DDIM update from `alphas.alpha` to `alphas.alpha_prev`
pub fn ddim_step<B: Backend>(
    latent: Tensor<B, 4>,
    noise_pred: Tensor<B, 4>,
    alphas: &StepAlphas,
) -> Result<Tensor<B, 4>, ScheduleError> {
    let StepAlphas {
        timestep,
        alpha: alpha_t,
        alpha_prev,
    } = *alphas;
    if !(alpha_t >= MIN_ALPHA) {
        return Err(ScheduleError::VanishingAlpha {
            timestep,
            alpha: alpha_t,
        });
    }

    let pred_x0 = predict_x0(latent, noise_pred.clone(), alpha_t);

    // Direction pointing to x_t
    let dir_xt = noise_pred * (1.0 - alpha_prev).max(0.0).sqrt();

    Ok(pred_x0 * alpha_prev.sqrt() + dir_xt)
}

/// Recover the clean sample implied by a noise estimate
pub fn predict_x0<B: Backend>(
    latent: Tensor<B, 4>,
    noise_pred: Tensor<B, 4>,
    alpha_t: f64,
) -> Tensor<B, 4> {
    (latent - noise_pred * (1.0 - alpha_t).sqrt()) / alpha_t.sqrt()
}

/// Forward-noise a clean sample to cumulative alpha `alpha`
pub fn add_noise<B: Backend>(x0: Tensor<B, 4>, noise: Tensor<B, 4>, alpha: f64) -> Tensor<B, 4> {
    x0 * alpha.sqrt() + noise * (1.0 - alpha).sqrt()
}
