//! Inpainting by compositing a re-noised known image into the trajectory

use std::ops::ControlFlow;

use burn::prelude::*;
use burn_sd_edit_samplers::{ddim_step, gaussian_noise, noise_rng, DdimConfig, DdimSampler};
use tracing::{debug, info};

use crate::components::ComponentFactory;
use crate::config::InpaintConfig;
use crate::diagnostics::{check_tensor, tensor_stats, tensor_values};
use crate::error::{PipelineError, UsageError};
use crate::guidance::GuidancePredictor;
use crate::output::ImageBatch;
use crate::pipeline::{
    check_noise_and_seed, expand_batch, report_progress, validate_run, StableDiffusion,
    DEBUG_STEPS,
};
use crate::progress::StepProgress;

/// Pixels per latent cell along each side
pub const LATENT_SCALE: usize = 8;

/// Blends known latent content into the sampled latent
///
/// `mask` is 1.0 where the known image is kept and 0.0 where it is generated.
#[derive(Debug, Clone)]
pub struct InpaintingCompositor<B: Backend> {
    /// `[batch, 1, h, w]` at latent resolution
    mask: Tensor<B, 4>,
    /// Encoded known image `[batch, 4, h, w]`
    known_x0: Tensor<B, 4>,
}

impl<B: Backend> InpaintingCompositor<B> {
    pub fn new(mask: Tensor<B, 4>, known_x0: Tensor<B, 4>) -> Self {
        Self { mask, known_x0 }
    }

    pub fn mask(&self) -> &Tensor<B, 4> {
        &self.mask
    }

    pub fn known_x0(&self) -> &Tensor<B, 4> {
        &self.known_x0
    }

    /// Known image at noise level `alpha_prev`; `None` means noise-free
    pub fn known_latent(&self, alpha_prev: f64, noise: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        let known = self.known_x0.clone() * alpha_prev.sqrt();
        match noise {
            Some(noise) => known + noise * (1.0 - alpha_prev).max(0.0).sqrt(),
            None => known,
        }
    }

    /// `mask * known + (1 - mask) * latent`
    pub fn composite(&self, latent: Tensor<B, 4>, known_latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let mask = self.mask.clone();
        known_latent * mask.clone() + latent * (mask.neg() + 1.0)
    }
}

/// Push a latent one step back up the noise schedule
///
/// `latent * sqrt(1 - beta_prev) + noise * sqrt(beta_prev)`
pub fn renoise<B: Backend>(latent: Tensor<B, 4>, beta_prev: f64, noise: Tensor<B, 4>) -> Tensor<B, 4> {
    let beta_prev = beta_prev.clamp(0.0, 1.0);
    latent * (1.0 - beta_prev).sqrt() + noise * beta_prev.sqrt()
}

/// Max-pool a `[batch, H, W]` mask by 8 to `[batch, 1, ceil(H / 8), ceil(W / 8)]`
pub fn downsample_mask<B: Backend>(mask: Tensor<B, 3>) -> Result<Tensor<B, 4>, PipelineError> {
    let [b, h, w] = mask.dims();
    let device = mask.device();
    let target_h = h.div_ceil(LATENT_SCALE);
    let target_w = w.div_ceil(LATENT_SCALE);
    let values = tensor_values(&mask)?;

    let mut result = Vec::with_capacity(b * target_h * target_w);
    for batch in 0..b {
        let plane = &values[batch * h * w..(batch + 1) * h * w];
        for th in 0..target_h {
            for tw in 0..target_w {
                let mut max = f32::NEG_INFINITY;
                for y in th * LATENT_SCALE..((th + 1) * LATENT_SCALE).min(h) {
                    for x in tw * LATENT_SCALE..((tw + 1) * LATENT_SCALE).min(w) {
                        max = max.max(plane[y * w + x]);
                    }
                }
                result.push(max);
            }
        }
    }

    Ok(Tensor::from_data(
        TensorData::new(result, [b, 1, target_h, target_w]),
        &device,
    ))
}

impl<B: Backend, F: ComponentFactory<B>> StableDiffusion<B, F> {
    /// Regenerate the unmasked part of `image` according to `prompt`
    ///
    /// # Arguments
    ///
    /// * `image` - `[1 | batch, 3, H, W]` with values in [0, 255]
    /// * `mask` - `[1 | batch, H, W]`, 1 where the image is kept
    /// * `noise` - Initial latent; mutually exclusive with `config.seed`
    pub fn inpaint(
        &self,
        prompt: &str,
        image: Tensor<B, 4>,
        mask: Tensor<B, 3>,
        noise: Option<Tensor<B, 4>>,
        config: &InpaintConfig,
        mut observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<ImageBatch, PipelineError> {
        check_noise_and_seed(noise.as_ref(), config.seed)?;
        validate_run(config.num_steps, config.batch_size)?;
        if config.num_resamples == 0 {
            return Err(UsageError::InvalidResampleCount.into());
        }
        let [_, img_h, img_w] = mask.dims();
        if [img_h, img_w] != [self.config().img_height, self.config().img_width] {
            return Err(UsageError::ShapeMismatch {
                what: "mask",
                expected: vec![mask.dims()[0], self.config().img_height, self.config().img_width],
                actual: mask.dims().to_vec(),
            }
            .into());
        }

        info!(
            "inpainting {} image(s), {} steps, {} resample(s), guidance {}",
            config.batch_size, config.num_steps, config.num_resamples, config.guidance_scale
        );

        let batch = config.batch_size;
        let context = expand_batch(self.encode_text(prompt)?, batch, "context")?;
        let uncond = self.unconditional_context(config.negative_prompt.as_deref(), batch)?;
        let known_x0 = expand_batch(self.encode_image(image, config.debug.nan)?, batch, "image")?;
        let mask = expand_batch(downsample_mask(mask)?, batch, "mask")?;
        let compositor = InpaintingCompositor::new(mask, known_x0);

        let sampler = DdimSampler::new(
            self.schedule(),
            DdimConfig {
                num_inference_steps: config.num_steps,
            },
        )?;

        let device = self.device().clone();
        let shape = self.latent_shape(batch);
        let mut rng = noise_rng(config.seed);
        let mut latent = match noise {
            Some(noise) => self.initial_latent(Some(noise), None, batch)?,
            None => gaussian_noise(shape, &mut rng, &device),
        };

        let predictor = GuidancePredictor::new(self.denoiser()?, config.debug.nan);
        let total_steps = sampler.num_steps();
        for (step_idx, alphas) in sampler.steps().iter().enumerate() {
            let t_emb = self.timestep_embedding(alphas.timestep, batch);
            let noisy = alphas.timestep > 1;
            let mut latent_prev = latent.clone();

            for resample in 0..config.num_resamples {
                // predict on the latent this step starts from, not the composite
                let noise_pred = predictor.guided_noise(
                    latent_prev.clone(),
                    t_emb.clone(),
                    context.clone(),
                    uncond.clone(),
                    config.guidance_scale,
                )?;
                latent = ddim_step(latent_prev.clone(), noise_pred, alphas)?;

                let noise = noisy.then(|| gaussian_noise(shape, &mut rng, &device));
                let known = compositor.known_latent(alphas.alpha_prev, noise);
                latent = compositor.composite(latent, known);

                if resample + 1 < config.num_resamples && noisy {
                    let jitter = gaussian_noise(shape, &mut rng, &device);
                    latent_prev = renoise(latent.clone(), alphas.beta_prev(), jitter);
                }
            }
            check_tensor(&latent, &format!("step_{step_idx}_latent"), config.debug.nan)?;

            if config.debug.sampler && step_idx < DEBUG_STEPS {
                debug!(
                    "step {} t={} latent: {}",
                    step_idx,
                    alphas.timestep,
                    tensor_stats(&latent)
                );
            }

            report_progress(
                &mut observer,
                StepProgress {
                    step: step_idx,
                    total_steps,
                    timestep: alphas.timestep,
                },
            )?;
        }

        self.decode_latent(latent, config.debug.nan)
    }
}
