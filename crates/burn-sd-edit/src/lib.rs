//! burn-sd-edit: Stable Diffusion 1.x with prompt-to-prompt editing and inpainting
//!
//! The pipeline drives external networks (tokenizer, text encoder, image
//! encoder, decoder, denoiser) through a DDIM sampling loop. Prompt edits work
//! by caching and overriding attention maps of the denoiser; inpainting
//! composites a re-noised known image into the trajectory.
//!
//! # Example
//!
//! ```ignore
//! use burn_sd_edit::{EditConfig, EditMethod, PipelineConfig, ProgressBarObserver, StableDiffusion};
//!
//! let pipeline = StableDiffusion::<Backend, _>::new(factory, PipelineConfig::default(), &device);
//!
//! let mut config = EditConfig::new(EditMethod::Replace, 0.2, 0.6);
//! config.seed = Some(42);
//!
//! let progress = ProgressBarObserver::new();
//! let images = pipeline.edit_image(
//!     "a photo of a cat",
//!     "a photo of a dog",
//!     None,
//!     &config,
//!     progress.observer(),
//! )?;
//! images.save_png("dog.png", 0)?;
//! ```

pub use burn_sd_edit_samplers as samplers;
pub use burn_sd_edit_unet as unet;

pub mod align;
pub mod codec;
pub mod components;
pub mod config;
pub mod diagnostics;
pub mod edit;
pub mod error;
pub mod guidance;
pub mod inpaint;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod text;

pub use align::{align_tokens, TokenAlignment};
pub use codec::{decode_latent, encode_pixels, pixels_to_unit};
pub use components::{ComponentFactory, ImageEncoder, LatentDecoder, TextEncoder, Tokenizer};
pub use config::{
    AttentionWindow, DebugConfig, EditConfig, EditMethod, GenerateConfig, InpaintConfig,
    PipelineConfig, SIZE_MULTIPLE,
};
pub use diagnostics::{check_tensor, tensor_stats};
pub use edit::{EditContexts, EditPlan, EditSampling, PromptEditOrchestrator, StepModes};
pub use error::{PipelineError, Result, UsageError};
pub use guidance::GuidancePredictor;
pub use inpaint::{downsample_mask, renoise, InpaintingCompositor, LATENT_SCALE};
pub use output::ImageBatch;
pub use pipeline::{StableDiffusion, LATENT_CHANNELS};
pub use progress::{no_progress, ProgressBarObserver, StepProgress};
pub use text::{
    create_attention_weights, pad_tokens, tokenize_prompt, unconditional_tokens, END_OF_TEXT,
    MAX_PROMPT_LENGTH, START_OF_TEXT,
};
