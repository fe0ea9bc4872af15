//! Stable Diffusion 1.x pipeline with lazily built components

use std::ops::ControlFlow;

use burn::prelude::*;
use burn_sd_edit_samplers::{
    ddim_step, gaussian_noise, noise_rng, timestep_embedding, DdimConfig, DdimSampler,
    NoiseSchedule, NUM_TRAIN_TIMESTEPS, TIMESTEP_EMBEDDING_DIM,
};
use once_cell::unsync::OnceCell;
use tracing::{debug, info};

use crate::codec::{decode_latent, encode_pixels};
use crate::components::{ComponentFactory, TextEncoder};
use crate::config::{GenerateConfig, PipelineConfig};
use crate::diagnostics::{check_tensor, tensor_stats};
use crate::error::{PipelineError, UsageError};
use crate::guidance::GuidancePredictor;
use crate::output::ImageBatch;
use crate::progress::StepProgress;
use crate::text::{self, position_ids, token_tensor, unconditional_tokens};

/// Latent channels of the SD 1.x autoencoder
pub const LATENT_CHANNELS: usize = 4;

/// Steps whose latent statistics are logged when sampler debugging is on
pub(crate) const DEBUG_STEPS: usize = 3;

/// Text-to-image, prompt editing and inpainting on one set of components
///
/// Components are built by the factory the first time a run needs them and
/// kept for the lifetime of the pipeline.
pub struct StableDiffusion<B: Backend, F: ComponentFactory<B>> {
    factory: F,
    config: PipelineConfig,
    device: B::Device,
    schedule: NoiseSchedule,
    tokenizer: OnceCell<F::Tokenizer>,
    text_encoder: OnceCell<F::TextEncoder>,
    image_encoder: OnceCell<F::ImageEncoder>,
    decoder: OnceCell<F::Decoder>,
    denoiser: OnceCell<F::Denoiser>,
}

impl<B: Backend, F: ComponentFactory<B>> StableDiffusion<B, F> {
    /// Image size is rounded to a multiple of 128
    pub fn new(factory: F, config: PipelineConfig, device: &B::Device) -> Self {
        let rounded = config.rounded();
        if rounded != config {
            info!(
                "image size {}x{} rounded to {}x{}",
                config.img_width, config.img_height, rounded.img_width, rounded.img_height
            );
        }

        Self {
            factory,
            config: rounded,
            device: device.clone(),
            schedule: NoiseSchedule::sd1x(),
            tokenizer: OnceCell::new(),
            text_encoder: OnceCell::new(),
            image_encoder: OnceCell::new(),
            decoder: OnceCell::new(),
            denoiser: OnceCell::new(),
        }
    }

    /// Replace the built-in SD 1.x alpha table
    pub fn with_schedule(mut self, schedule: NoiseSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn tokenizer(&self) -> Result<&F::Tokenizer, PipelineError> {
        self.tokenizer.get_or_try_init(|| {
            debug!("building tokenizer");
            self.factory.tokenizer()
        })
    }

    pub fn text_encoder(&self) -> Result<&F::TextEncoder, PipelineError> {
        self.text_encoder.get_or_try_init(|| {
            debug!("building text encoder");
            self.factory.text_encoder(&self.device)
        })
    }

    pub fn image_encoder(&self) -> Result<&F::ImageEncoder, PipelineError> {
        self.image_encoder.get_or_try_init(|| {
            debug!("building image encoder");
            self.factory.image_encoder(&self.config, &self.device)
        })
    }

    pub fn decoder(&self) -> Result<&F::Decoder, PipelineError> {
        self.decoder.get_or_try_init(|| {
            debug!("building decoder");
            self.factory.decoder(&self.config, &self.device)
        })
    }

    pub fn denoiser(&self) -> Result<&F::Denoiser, PipelineError> {
        self.denoiser.get_or_try_init(|| {
            debug!("building denoiser");
            self.factory.denoiser(&self.config, &self.device)
        })
    }

    /// Token ids of `prompt`, padded to 77
    pub fn tokenize_prompt(&self, prompt: &str) -> Result<Vec<u32>, PipelineError> {
        Ok(text::tokenize_prompt(self.tokenizer()?, prompt)?)
    }

    /// Encode a prompt to a `[1, 77, dim]` context
    ///
    /// Fails with [`UsageError::PromptTooLong`] beyond 77 tokens.
    pub fn encode_text(&self, prompt: &str) -> Result<Tensor<B, 3>, PipelineError> {
        let tokens = self.tokenize_prompt(prompt)?;
        self.encode_tokens(&tokens)
    }

    pub(crate) fn encode_tokens(&self, tokens: &[u32]) -> Result<Tensor<B, 3>, PipelineError> {
        let encoder = self.text_encoder()?;
        Ok(encoder.encode(
            token_tensor(tokens, &self.device),
            position_ids(&self.device),
        ))
    }

    /// Context of the negative prompt, or of the empty prompt, repeated to `batch_size`
    pub fn unconditional_context(
        &self,
        negative_prompt: Option<&str>,
        batch_size: usize,
    ) -> Result<Tensor<B, 3>, PipelineError> {
        let context = match negative_prompt {
            Some(prompt) => self.encode_text(prompt)?,
            None => self.encode_tokens(&unconditional_tokens())?,
        };
        Ok(expand_batch(context, batch_size, "unconditional context")?)
    }

    /// Per-token attention multipliers for `edit_weights`
    ///
    /// See [`text::create_attention_weights`].
    pub fn create_attention_weights(
        &self,
        prompt: &str,
        word_weights: &[(&str, f32)],
    ) -> Result<Vec<f32>, PipelineError> {
        Ok(text::create_attention_weights(
            self.tokenizer()?,
            prompt,
            word_weights,
        )?)
    }

    /// Encode `prompt` and generate from it
    pub fn text_to_image(
        &self,
        prompt: &str,
        config: &GenerateConfig,
        observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<ImageBatch, PipelineError> {
        let context = self.encode_text(prompt)?;
        self.generate_image(context, None, config, observer)
    }

    /// Generate images from an encoded prompt
    ///
    /// # Arguments
    ///
    /// * `context` - Encoded prompt, batch 1 or `config.batch_size`
    /// * `noise` - Initial latent; mutually exclusive with `config.seed`
    /// * `observer` - Called after every step; `Break` cancels the run
    pub fn generate_image(
        &self,
        context: Tensor<B, 3>,
        noise: Option<Tensor<B, 4>>,
        config: &GenerateConfig,
        observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<ImageBatch, PipelineError> {
        let latent = self.generate_latent(context, noise, config, observer)?;
        decode_latent(self.decoder()?, latent, config.debug.nan)
    }

    /// [`generate_image`](Self::generate_image) without the decoder
    pub fn generate_latent(
        &self,
        context: Tensor<B, 3>,
        noise: Option<Tensor<B, 4>>,
        config: &GenerateConfig,
        mut observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<Tensor<B, 4>, PipelineError> {
        check_noise_and_seed(noise.as_ref(), config.seed)?;
        validate_run(config.num_steps, config.batch_size)?;
        info!(
            "generating {} image(s) {}x{}, {} steps, guidance {}",
            config.batch_size,
            self.config.img_width,
            self.config.img_height,
            config.num_steps,
            config.guidance_scale
        );

        let batch = config.batch_size;
        let context = expand_batch(context, batch, "context")?;
        let uncond = self.unconditional_context(config.negative_prompt.as_deref(), batch)?;
        let sampler = DdimSampler::new(
            &self.schedule,
            DdimConfig {
                num_inference_steps: config.num_steps,
            },
        )?;

        let mut latent = self.initial_latent(noise, config.seed, batch)?;
        if config.debug.sampler {
            debug!("initial latent: {}", tensor_stats(&latent));
        }

        let predictor = GuidancePredictor::new(self.denoiser()?, config.debug.nan);
        let total_steps = sampler.num_steps();
        for (step_idx, alphas) in sampler.steps().iter().enumerate() {
            let t_emb = self.timestep_embedding(alphas.timestep, batch);
            let noise_pred = predictor.guided_noise(
                latent.clone(),
                t_emb,
                context.clone(),
                uncond.clone(),
                config.guidance_scale,
            )?;
            latent = ddim_step(latent, noise_pred, alphas)?;
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

        Ok(latent)
    }

    /// Encode `[batch, 3, H, W]` pixels in [0, 255] to latents
    pub fn encode_image(
        &self,
        pixels: Tensor<B, 4>,
        check_nan: bool,
    ) -> Result<Tensor<B, 4>, PipelineError> {
        let [batch, channels, height, width] = pixels.dims();
        let expected = [batch, 3, self.config.img_height, self.config.img_width];
        if [batch, channels, height, width] != expected {
            return Err(UsageError::ShapeMismatch {
                what: "image",
                expected: expected.to_vec(),
                actual: vec![batch, channels, height, width],
            }
            .into());
        }
        encode_pixels(self.image_encoder()?, pixels, check_nan)
    }

    /// Decode latents to images
    pub fn decode_latent(
        &self,
        latent: Tensor<B, 4>,
        check_nan: bool,
    ) -> Result<ImageBatch, PipelineError> {
        decode_latent(self.decoder()?, latent, check_nan)
    }

    pub(crate) fn latent_shape(&self, batch: usize) -> [usize; 4] {
        let [height, width] = self.config.latent_size();
        [batch, LATENT_CHANNELS, height, width]
    }

    pub(crate) fn timestep_embedding(&self, timestep: usize, batch: usize) -> Tensor<B, 2> {
        timestep_embedding(timestep, batch, TIMESTEP_EMBEDDING_DIM, &self.device)
    }

    /// Given noise repeated to `batch`, or fresh noise from `seed`
    pub(crate) fn initial_latent(
        &self,
        noise: Option<Tensor<B, 4>>,
        seed: Option<u64>,
        batch: usize,
    ) -> Result<Tensor<B, 4>, PipelineError> {
        let shape = self.latent_shape(batch);
        match noise {
            Some(noise) => {
                let noise = expand_batch(noise, batch, "noise")?;
                if noise.dims() != shape {
                    return Err(UsageError::ShapeMismatch {
                        what: "noise",
                        expected: shape.to_vec(),
                        actual: noise.dims().to_vec(),
                    }
                    .into());
                }
                Ok(noise)
            }
            None => Ok(gaussian_noise(shape, &mut noise_rng(seed), &self.device)),
        }
    }
}

pub(crate) fn check_noise_and_seed<B: Backend>(
    noise: Option<&Tensor<B, 4>>,
    seed: Option<u64>,
) -> Result<(), UsageError> {
    if noise.is_some() && seed.is_some() {
        return Err(UsageError::NoiseAndSeed);
    }
    Ok(())
}

pub(crate) fn validate_run(num_steps: usize, batch_size: usize) -> Result<(), UsageError> {
    if num_steps == 0 || num_steps >= NUM_TRAIN_TIMESTEPS {
        return Err(UsageError::InvalidStepCount(num_steps));
    }
    if batch_size == 0 {
        return Err(UsageError::InvalidBatchSize);
    }
    Ok(())
}

/// Repeat a batch-1 tensor to `batch`; any other mismatch is an error
pub(crate) fn expand_batch<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    batch: usize,
    what: &'static str,
) -> Result<Tensor<B, D>, UsageError> {
    let dims = tensor.dims();
    match dims[0] {
        n if n == batch => Ok(tensor),
        1 => Ok(tensor.repeat_dim(0, batch)),
        _ => {
            let mut expected = dims.to_vec();
            expected[0] = batch;
            Err(UsageError::ShapeMismatch {
                what,
                expected,
                actual: dims.to_vec(),
            })
        }
    }
}

/// Notify the observer, turning `Break` into [`PipelineError::Cancelled`]
pub(crate) fn report_progress(
    observer: &mut impl FnMut(StepProgress) -> ControlFlow<()>,
    progress: StepProgress,
) -> Result<(), PipelineError> {
    match observer(progress) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => {
            info!("cancelled after {} of {} steps", progress.completed(), progress.total_steps);
            Err(PipelineError::Cancelled {
                completed: progress.completed(),
            })
        }
    }
}
