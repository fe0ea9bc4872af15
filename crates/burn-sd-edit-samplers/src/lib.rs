//! Noise schedule and DDIM stepping for SD 1.x latent diffusion
//!
//! - [`NoiseSchedule`]: the 1000-step cumulative-alpha table and strided timesteps
//! - [`DdimSampler`]: deterministic DDIM update in descending timestep order
//! - [`apply_guidance`]: classifier-free guidance combination
//! - [`gaussian_noise`]: seeded host-side noise
//! - [`timestep_embedding`]: sinusoidal embedding of the current timestep

pub mod ddim;
pub mod embedding;
pub mod guidance;
pub mod noise;
pub mod scheduler;

pub use ddim::{add_noise, ddim_step, predict_x0, DdimConfig, DdimSampler};
pub use embedding::{timestep_embedding, MAX_PERIOD, TIMESTEP_EMBEDDING_DIM};
pub use guidance::apply_guidance;
pub use noise::{gaussian_noise, noise_rng};
pub use scheduler::{
    inference_timesteps, NoiseSchedule, ScheduleError, StepAlphas, MIN_ALPHA, NUM_TRAIN_TIMESTEPS,
};
