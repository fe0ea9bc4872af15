//! External collaborators
//!
//! The networks and the tokenizer are black boxes with a fixed tensor
//! contract. A [`ComponentFactory`] builds each of them; the pipeline asks for
//! a component the first time it is needed and keeps it afterwards.

use burn::prelude::*;
use burn_sd_edit_unet::DenoisingNetwork;

use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Text to token ids, including the start and end tokens
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32>;
}

/// Token ids `[batch, 77]` and position ids `[1, 77]` to context `[batch, 77, dim]`
pub trait TextEncoder<B: Backend> {
    fn encode(&self, tokens: Tensor<B, 2, Int>, position_ids: Tensor<B, 2, Int>) -> Tensor<B, 3>;
}

/// Image `[batch, 3, H, W]` in [-1, 1] to latent `[batch, 4, H / 8, W / 8]`
pub trait ImageEncoder<B: Backend> {
    fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Latent `[batch, 4, H / 8, W / 8]` to image `[batch, 3, H, W]` in [-1, 1]
pub trait LatentDecoder<B: Backend> {
    fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Builds the pipeline's collaborators on demand
pub trait ComponentFactory<B: Backend> {
    type Tokenizer: Tokenizer;
    type TextEncoder: TextEncoder<B>;
    type ImageEncoder: ImageEncoder<B>;
    type Decoder: LatentDecoder<B>;
    type Denoiser: DenoisingNetwork<B>;

    fn tokenizer(&self) -> Result<Self::Tokenizer, PipelineError>;

    fn text_encoder(&self, device: &B::Device) -> Result<Self::TextEncoder, PipelineError>;

    fn image_encoder(
        &self,
        config: &PipelineConfig,
        device: &B::Device,
    ) -> Result<Self::ImageEncoder, PipelineError>;

    fn decoder(
        &self,
        config: &PipelineConfig,
        device: &B::Device,
    ) -> Result<Self::Decoder, PipelineError>;

    fn denoiser(
        &self,
        config: &PipelineConfig,
        device: &B::Device,
    ) -> Result<Self::Denoiser, PipelineError>;
}
