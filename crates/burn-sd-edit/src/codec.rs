//! Pixel space to latent space and back

use burn::prelude::*;

use crate::components::{ImageEncoder, LatentDecoder};
use crate::diagnostics::check_tensor;
use crate::error::PipelineError;
use crate::output::ImageBatch;

/// Map pixel values in [0, 255] to [-1, 1]
pub fn pixels_to_unit<B: Backend>(pixels: Tensor<B, 4>) -> Tensor<B, 4> {
    pixels / 255.0 * 2.0 - 1.0
}

/// Encode `[batch, 3, H, W]` pixels in [0, 255] to latents
pub fn encode_pixels<B: Backend>(
    encoder: &impl ImageEncoder<B>,
    pixels: Tensor<B, 4>,
    check_nan: bool,
) -> Result<Tensor<B, 4>, PipelineError> {
    let latent = encoder.encode(pixels_to_unit(pixels));
    check_tensor(&latent, "encoded_latent", check_nan)?;
    Ok(latent)
}

/// Decode latents into a `u8` image batch
pub fn decode_latent<B: Backend>(
    decoder: &impl LatentDecoder<B>,
    latent: Tensor<B, 4>,
    check_nan: bool,
) -> Result<ImageBatch, PipelineError> {
    check_tensor(&latent, "decoder_input_latent", check_nan)?;
    let decoded = decoder.decode(latent);
    check_tensor(&decoded, "decoder_output", check_nan)?;
    ImageBatch::from_decoded(decoded)
}
