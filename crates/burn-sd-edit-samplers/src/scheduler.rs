//! Noise schedule for SD 1.x latent diffusion
//!
//! Holds the 1000-entry cumulative-alpha table and derives the strided
//! timestep subsequence used at inference, together with the
//! `(alpha_t, alpha_prev)` pair each DDIM step needs.

use thiserror::Error;

/// Number of timesteps the model was trained with
pub const NUM_TRAIN_TIMESTEPS: usize = 1000;

/// SD 1.x scaled-linear beta schedule endpoints
const BETA_START: f32 = 0.00085;
const BETA_END: f32 = 0.012;

/// Alphas below this make `pred_x0 = (x - sqrt(1-a)*e) / sqrt(a)` blow up
pub const MIN_ALPHA: f64 = 1e-8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("number of steps must be in [1, {max}), got {steps}")]
    InvalidStepCount { steps: usize, max: usize },

    #[error("alpha table must have {expected} entries, got {actual}")]
    TableLength { expected: usize, actual: usize },

    #[error("alpha table entry {index} is {value}, expected a value in (0, 1]")]
    AlphaOutOfRange { index: usize, value: f64 },

    #[error("alpha table increases at index {index}")]
    NotMonotonic { index: usize },

    #[error("alpha_t = {alpha} at timestep {timestep} is too close to zero")]
    VanishingAlpha { timestep: usize, alpha: f64 },

    #[error("timestep {0} is outside the training schedule")]
    TimestepOutOfRange(usize),

    #[error("step index {index} is out of range for a {steps}-step sampler")]
    StepOutOfRange { index: usize, steps: usize },
}

/// Interpolation coefficients for one inference step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepAlphas {
    /// Timestep index into the training schedule
    pub timestep: usize,
    /// Cumulative alpha at `timestep`
    pub alpha: f64,
    /// Cumulative alpha of the next (less noisy) step; 1.0 for the earliest step
    pub alpha_prev: f64,
}

impl StepAlphas {
    /// `1 - alpha / alpha_prev`, the variance used to re-noise one step back
    pub fn beta_prev(&self) -> f64 {
        1.0 - self.alpha / self.alpha_prev
    }

    /// Position of this step in edit windows: 0.0 at pure noise, 1.0 when clean
    pub fn t_scale(&self) -> f64 {
        NUM_TRAIN_TIMESTEPS.saturating_sub(self.timestep) as f64 / NUM_TRAIN_TIMESTEPS as f64
    }
}

/// Precomputed cumulative-alpha table
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// The SD 1.x schedule: betas linear in sqrt space between 0.00085 and 0.012
    ///
    /// Evaluated in f32 so the table matches the float32 constants the
    /// released checkpoints were sampled with.
    pub fn sd1x() -> Self {
        let alphas_cumprod = scaled_linear_alphas(NUM_TRAIN_TIMESTEPS, BETA_START, BETA_END);
        debug_assert!(validate_table(&alphas_cumprod).is_ok());
        Self { alphas_cumprod }
    }

    /// Build a schedule from an externally supplied table
    ///
    /// The table must hold exactly 1000 values in (0, 1], non-increasing.
    pub fn from_table(alphas_cumprod: Vec<f64>) -> Result<Self, ScheduleError> {
        validate_table(&alphas_cumprod)?;
        Ok(Self { alphas_cumprod })
    }

    pub fn num_train_steps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// Cumulative alpha at a training timestep
    pub fn alpha_cumprod_at(&self, t: usize) -> Result<f64, ScheduleError> {
        self.alphas_cumprod
            .get(t)
            .copied()
            .ok_or(ScheduleError::TimestepOutOfRange(t))
    }

    /// Strided timesteps in ascending order: `1, 1 + k, 1 + 2k, ...` with `k = 1000 / num_steps`
    pub fn timesteps(&self, num_steps: usize) -> Result<Vec<usize>, ScheduleError> {
        let n = self.num_train_steps();
        if num_steps == 0 || num_steps >= n {
            return Err(ScheduleError::InvalidStepCount {
                steps: num_steps,
                max: n,
            });
        }
        Ok(inference_timesteps(num_steps, n))
    }

    /// Per-step alphas in ascending timestep order
    ///
    /// `alpha_prev` of entry `i` is the alpha of entry `i - 1`, and 1.0 for the
    /// first entry. Every alpha is checked against [`MIN_ALPHA`].
    pub fn step_alphas(&self, num_steps: usize) -> Result<Vec<StepAlphas>, ScheduleError> {
        let timesteps = self.timesteps(num_steps)?;
        let mut alpha_prev = 1.0;
        let mut steps = Vec::with_capacity(timesteps.len());

        for timestep in timesteps {
            let alpha = self.alpha_cumprod_at(timestep)?;
            if alpha < MIN_ALPHA {
                return Err(ScheduleError::VanishingAlpha { timestep, alpha });
            }
            steps.push(StepAlphas {
                timestep,
                alpha,
                alpha_prev,
            });
            alpha_prev = alpha;
        }

        Ok(steps)
    }
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self::sd1x()
    }
}

/// `range(1, num_train_steps, num_train_steps / num_inference_steps)`
pub fn inference_timesteps(num_inference_steps: usize, num_train_steps: usize) -> Vec<usize> {
    let stride = (num_train_steps / num_inference_steps).max(1);
    (1..num_train_steps).step_by(stride).collect()
}

fn scaled_linear_alphas(num_steps: usize, beta_start: f32, beta_end: f32) -> Vec<f64> {
    let start = beta_start.sqrt();
    let end = beta_end.sqrt();
    let delta = (end - start) / (num_steps - 1) as f32;

    let mut cumprod = 1.0f32;
    (0..num_steps)
        .map(|i| {
            // linspace endpoint is pinned to sqrt(beta_end)
            let sqrt_beta = if i + 1 == num_steps {
                end
            } else {
                start + delta * i as f32
            };
            cumprod *= 1.0 - sqrt_beta * sqrt_beta;
            cumprod as f64
        })
        .collect()
}

fn validate_table(table: &[f64]) -> Result<(), ScheduleError> {
    if table.len() != NUM_TRAIN_TIMESTEPS {
        return Err(ScheduleError::TableLength {
            expected: NUM_TRAIN_TIMESTEPS,
            actual: table.len(),
        });
    }

    for (index, &value) in table.iter().enumerate() {
        if !value.is_finite() || value <= 0.0 || value > 1.0 {
            return Err(ScheduleError::AlphaOutOfRange { index, value });
        }
        if index > 0 && value > table[index - 1] {
            return Err(ScheduleError::NotMonotonic { index });
        }
    }

    Ok(())
}
