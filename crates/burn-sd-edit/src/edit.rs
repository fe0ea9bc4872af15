//! Prompt-to-prompt editing
//!
//! Every step runs three denoiser passes over the same latent:
//!
//! 1. unconditional context, all layers `Unconditional`
//! 2. original prompt, all layers `Save` (output discarded, maps cached)
//! 3. edited prompt, layers set from the [`EditPlan`] for this step
//!
//! The guided noise combines passes 1 and 3.

use std::ops::ControlFlow;

use burn::prelude::*;
use burn_sd_edit_samplers::{
    apply_guidance, ddim_step, timestep_embedding, DdimConfig, DdimSampler,
    TIMESTEP_EMBEDDING_DIM,
};
use burn_sd_edit_unet::{
    AttentionControl, AttentionKind, AttentionLayerId, DenoisingNetwork, InterceptionMode,
};
use tracing::{debug, info};

use crate::align::{align_tokens, TokenAlignment};
use crate::components::{ComponentFactory, Tokenizer};
use crate::config::{AttentionWindow, DebugConfig, EditConfig, EditMethod};
use crate::diagnostics::{check_tensor, tensor_stats};
use crate::error::{PipelineError, UsageError};
use crate::guidance::GuidancePredictor;
use crate::output::ImageBatch;
use crate::pipeline::{
    check_noise_and_seed, expand_batch, report_progress, validate_run, StableDiffusion,
    DEBUG_STEPS,
};
use crate::progress::StepProgress;
use crate::text::{pad_tokens, MAX_PROMPT_LENGTH};

/// Interception settings for the edited pass of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepModes {
    pub cross: InterceptionMode,
    pub self_attn: InterceptionMode,
    /// Scale cross-attention by the edit weights
    pub use_weights: bool,
}

/// What to edit and when, fixed for a whole run
#[derive(Debug, Clone, PartialEq)]
pub struct EditPlan {
    pub method: EditMethod,
    pub self_attn_window: AttentionWindow,
    pub cross_attn_window: AttentionWindow,
    /// Original-to-edited token mapping, used by `refine`
    pub alignment: Option<TokenAlignment>,
    /// One multiplier per edited-prompt token
    pub edit_weights: Option<Vec<f32>>,
}

impl EditPlan {
    /// Validate the edit settings of `config`
    ///
    /// `reweight` needs weights; weights need one entry per token.
    pub fn new(config: &EditConfig, alignment: Option<TokenAlignment>) -> Result<Self, UsageError> {
        let edit_weights = config.weights().map(<[f32]>::to_vec);
        match &edit_weights {
            None if config.method == EditMethod::Reweight => {
                return Err(UsageError::MissingEditWeights)
            }
            Some(weights) if weights.len() != MAX_PROMPT_LENGTH => {
                return Err(UsageError::InvalidEditWeights {
                    len: weights.len(),
                    expected: MAX_PROMPT_LENGTH,
                })
            }
            _ => {}
        }

        Ok(Self {
            method: config.method,
            self_attn_window: config.self_attn_window,
            cross_attn_window: config.cross_attn_window,
            alignment,
            edit_weights,
        })
    }

    /// Modes for the edited pass at `t_scale = 1 - timestep / 1000`
    pub fn step_modes(&self, t_scale: f64) -> StepModes {
        let (cross, use_weights) = if self.cross_attn_window.contains(t_scale) {
            let mode = match self.method {
                EditMethod::Replace => InterceptionMode::UseLast,
                EditMethod::Refine => InterceptionMode::Edit,
                EditMethod::Reweight => InterceptionMode::Injection,
            };
            let use_weights =
                self.method == EditMethod::Reweight || self.edit_weights.is_some();
            (mode, use_weights)
        } else {
            (InterceptionMode::Injection, false)
        };

        let self_attn = if self.self_attn_window.contains(t_scale) {
            InterceptionMode::UseLast
        } else {
            InterceptionMode::Injection
        };

        StepModes {
            cross,
            self_attn,
            use_weights,
        }
    }

    /// Hand alignment and weights to the cross-attention layers
    fn install<B: Backend>(&self, control: &mut AttentionControl<B>, device: &B::Device) {
        if let Some(alignment) = &self.alignment {
            let n = alignment.len();
            let mask =
                Tensor::<B, 1>::from_data(TensorData::new(alignment.mask.clone(), [n]), device);
            let indices = Tensor::<B, 1, Int>::from_data(
                TensorData::new(alignment.indices.clone(), [n]),
                device,
            );
            control.set_edit_alignment(mask, indices);
        }
        if let Some(weights) = &self.edit_weights {
            let n = weights.len();
            let weights = Tensor::from_data(TensorData::new(weights.clone(), [n]), device);
            control.set_edit_weights(weights);
        }
    }
}

/// Encoded prompts of an edit run, all `[batch, 77, dim]`
#[derive(Debug, Clone)]
pub struct EditContexts<B: Backend> {
    pub unconditional: Tensor<B, 3>,
    pub original: Tensor<B, 3>,
    pub edited: Tensor<B, 3>,
}

/// Step settings shared by every timestep of an edit run
#[derive(Debug, Clone, Copy)]
pub struct EditSampling<'a> {
    pub sampler: &'a DdimSampler,
    pub guidance_scale: f64,
    pub debug: DebugConfig,
}

/// Sole owner of the interception state during prompt-to-prompt runs
///
/// State is returned to neutral when a run starts and on every exit path,
/// so a later unrelated generation is unaffected.
pub struct PromptEditOrchestrator<B: Backend> {
    control: AttentionControl<B>,
}

impl<B: Backend> PromptEditOrchestrator<B> {
    pub fn new(layers: impl IntoIterator<Item = AttentionLayerId>) -> Self {
        Self {
            control: AttentionControl::new(layers),
        }
    }

    /// Registry covering every attention layer of `denoiser`
    pub fn for_denoiser(denoiser: &impl DenoisingNetwork<B>) -> Self {
        Self::new(denoiser.attention_layers())
    }

    pub fn control(&self) -> &AttentionControl<B> {
        &self.control
    }

    /// Denoise `latent` through every step of `sampling.sampler`
    pub fn run(
        &mut self,
        denoiser: &impl DenoisingNetwork<B>,
        plan: &EditPlan,
        contexts: &EditContexts<B>,
        latent: Tensor<B, 4>,
        sampling: EditSampling<'_>,
        observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<Tensor<B, 4>, PipelineError> {
        self.control.reset();
        plan.install(&mut self.control, &latent.device());

        let result = self.sample(denoiser, plan, contexts, latent, sampling, observer);

        self.control.reset();
        result
    }

    fn sample(
        &mut self,
        denoiser: &impl DenoisingNetwork<B>,
        plan: &EditPlan,
        contexts: &EditContexts<B>,
        mut latent: Tensor<B, 4>,
        sampling: EditSampling<'_>,
        mut observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<Tensor<B, 4>, PipelineError> {
        let device = latent.device();
        let [batch, ..] = latent.dims();
        let debug = sampling.debug;
        let predictor = GuidancePredictor::new(denoiser, debug.nan);
        let total_steps = sampling.sampler.num_steps();

        for (step_idx, alphas) in sampling.sampler.steps().iter().enumerate() {
            let t_emb = timestep_embedding(alphas.timestep, batch, TIMESTEP_EMBEDDING_DIM, &device);

            self.control.set_mode_all(InterceptionMode::Unconditional);
            let noise_uncond = predictor.predict(
                latent.clone(),
                t_emb.clone(),
                contexts.unconditional.clone(),
                &mut self.control,
                &format!("step_{step_idx}_noise_uncond"),
            )?;

            self.control.set_mode_all(InterceptionMode::Save);
            predictor.predict(
                latent.clone(),
                t_emb.clone(),
                contexts.original.clone(),
                &mut self.control,
                &format!("step_{step_idx}_noise_original"),
            )?;

            let modes = plan.step_modes(alphas.t_scale());
            self.control.set_mode(AttentionKind::CrossAttention, modes.cross);
            self.control.set_use_weights(AttentionKind::CrossAttention, modes.use_weights);
            self.control.set_mode(AttentionKind::SelfAttention, modes.self_attn);

            let noise_edit = predictor.predict(
                latent.clone(),
                t_emb,
                contexts.edited.clone(),
                &mut self.control,
                &format!("step_{step_idx}_noise_edit"),
            )?;
            self.control.clear_use_weights();

            let noise_pred = apply_guidance(noise_uncond, noise_edit, sampling.guidance_scale);
            latent = ddim_step(latent, noise_pred, alphas)?;
            check_tensor(&latent, &format!("step_{step_idx}_latent"), debug.nan)?;

            if debug.sampler && step_idx < DEBUG_STEPS {
                debug!(
                    "step {} t={} cross={} self={} weights={} latent: {}",
                    step_idx,
                    alphas.timestep,
                    modes.cross,
                    modes.self_attn,
                    modes.use_weights,
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
}

impl<B: Backend, F: ComponentFactory<B>> StableDiffusion<B, F> {
    /// Generate `prompt_edit` while keeping the layout of `prompt`
    ///
    /// `noise` replaces the seeded starting latent and cannot be combined
    /// with `config.seed`.
    pub fn edit_image(
        &self,
        prompt: &str,
        prompt_edit: &str,
        noise: Option<Tensor<B, 4>>,
        config: &EditConfig,
        observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<ImageBatch, PipelineError> {
        validate_edit(config, noise.as_ref())?;
        let mut orchestrator = PromptEditOrchestrator::for_denoiser(self.denoiser()?);
        self.edit_image_with(&mut orchestrator, prompt, prompt_edit, noise, config, observer)
    }

    /// [`edit_image`](Self::edit_image) with a caller-owned orchestrator
    pub fn edit_image_with(
        &self,
        orchestrator: &mut PromptEditOrchestrator<B>,
        prompt: &str,
        prompt_edit: &str,
        noise: Option<Tensor<B, 4>>,
        config: &EditConfig,
        observer: impl FnMut(StepProgress) -> ControlFlow<()>,
    ) -> Result<ImageBatch, PipelineError> {
        validate_edit(config, noise.as_ref())?;

        let tokenizer = self.tokenizer()?;
        let tokens = tokenizer.encode(prompt);
        let tokens_edit = tokenizer.encode(prompt_edit);
        let alignment =
            (config.method == EditMethod::Refine).then(|| align_tokens(&tokens, &tokens_edit));
        let tokens = pad_tokens(tokens)?;
        let tokens_edit = pad_tokens(tokens_edit)?;
        let plan = EditPlan::new(config, alignment)?;

        info!(
            "editing {} image(s) with {}, self window [{}, {}], cross window [{}, {}], {} steps",
            config.batch_size,
            config.method,
            plan.self_attn_window.start,
            plan.self_attn_window.end,
            plan.cross_attn_window.start,
            plan.cross_attn_window.end,
            config.num_steps
        );

        let batch = config.batch_size;
        let contexts = EditContexts {
            unconditional: self.unconditional_context(config.negative_prompt.as_deref(), batch)?,
            original: expand_batch(self.encode_tokens(&tokens)?, batch, "context")?,
            edited: expand_batch(self.encode_tokens(&tokens_edit)?, batch, "edited context")?,
        };
        let sampler = DdimSampler::new(
            self.schedule(),
            DdimConfig {
                num_inference_steps: config.num_steps,
            },
        )?;
        let latent = self.initial_latent(noise, config.seed, batch)?;

        let latent = orchestrator.run(
            self.denoiser()?,
            &plan,
            &contexts,
            latent,
            EditSampling {
                sampler: &sampler,
                guidance_scale: config.guidance_scale,
                debug: config.debug,
            },
            observer,
        )?;

        self.decode_latent(latent, config.debug.nan)
    }
}

/// Argument checks that need no component
fn validate_edit<B: Backend>(
    config: &EditConfig,
    noise: Option<&Tensor<B, 4>>,
) -> Result<(), UsageError> {
    check_noise_and_seed(noise, config.seed)?;
    validate_run(config.num_steps, config.batch_size)?;
    EditPlan::new(config, None).map(|_| ())
}
