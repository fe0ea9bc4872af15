//! Small deterministic collaborators for pipeline tests

#![allow(dead_code)]

use std::cell::Cell;

use burn::prelude::*;
use burn_ndarray::NdArray;
use burn_sd_edit::{
    ComponentFactory, ImageEncoder, LatentDecoder, PipelineConfig, PipelineError,
    StableDiffusion, TextEncoder, Tokenizer, END_OF_TEXT, START_OF_TEXT,
};
use burn_sd_edit_unet::{SpatialDenoiser, SpatialDenoiserConfig};

pub type TestBackend = NdArray<f32>;

pub const CONTEXT_DIM: usize = 8;

/// One token per whitespace-separated word, ids hashed below 1000
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = vec![START_OF_TEXT];
        ids.extend(text.split_whitespace().map(word_id));
        ids.push(END_OF_TEXT);
        ids
    }
}

fn word_id(word: &str) -> u32 {
    // FNV-1a
    let hash = word
        .bytes()
        .fold(0x811c9dc5u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x01000193));
    hash % 1000
}

/// Sinusoidal features of token id and position
pub struct SinusoidTextEncoder;

impl<B: Backend> TextEncoder<B> for SinusoidTextEncoder {
    fn encode(&self, tokens: Tensor<B, 2, Int>, position_ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, len] = tokens.dims();
        let device = tokens.device();
        let ids: Vec<i64> = tokens.into_data().convert::<i64>().to_vec().unwrap();
        let positions: Vec<i64> = position_ids.into_data().convert::<i64>().to_vec().unwrap();

        let mut values = Vec::with_capacity(batch * len * CONTEXT_DIM);
        for (i, &id) in ids.iter().enumerate() {
            let pos = positions[i % len] as f32;
            for d in 0..CONTEXT_DIM {
                let freq = (d + 1) as f32;
                values.push((id as f32 * 0.01 * freq + pos * 0.1).sin());
            }
        }
        Tensor::from_data(TensorData::new(values, [batch, len, CONTEXT_DIM]), &device)
    }
}

/// 8x8 block means of RGB plus their channel mean
pub struct BlockMeanEncoder;

impl<B: Backend> ImageEncoder<B> for BlockMeanEncoder {
    fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = image.dims();
        let (lh, lw) = (h / 8, w / 8);
        let pooled: Tensor<B, 4> = image
            .reshape([b, c, lh, 8, lw, 8])
            .mean_dim(3)
            .mean_dim(5)
            .reshape([b, c, lh, lw]);
        let overall = pooled.clone().mean_dim(1);
        Tensor::cat(vec![pooled, overall], 1)
    }
}

/// Nearest 8x upsampling of the first three latent channels
pub struct UpsampleDecoder;

impl<B: Backend> LatentDecoder<B> for UpsampleDecoder {
    fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, _, h, w] = latent.dims();
        latent
            .slice([0..b, 0..3, 0..h, 0..w])
            .reshape([b, 3, h, 1, w, 1])
            .repeat_dim(3, 8)
            .repeat_dim(5, 8)
            .reshape([b, 3, h * 8, w * 8])
            .tanh()
    }
}

/// Builds the mocks and a tiny spatial denoiser, counting every build
#[derive(Default)]
pub struct TinyFactory {
    pub builds: Cell<usize>,
    pub fail_decoder: bool,
}

impl ComponentFactory<TestBackend> for TinyFactory {
    type Tokenizer = WordTokenizer;
    type TextEncoder = SinusoidTextEncoder;
    type ImageEncoder = BlockMeanEncoder;
    type Decoder = UpsampleDecoder;
    type Denoiser = SpatialDenoiser<TestBackend>;

    fn tokenizer(&self) -> Result<WordTokenizer, PipelineError> {
        self.builds.set(self.builds.get() + 1);
        Ok(WordTokenizer)
    }

    fn text_encoder(
        &self,
        _device: &<TestBackend as Backend>::Device,
    ) -> Result<SinusoidTextEncoder, PipelineError> {
        self.builds.set(self.builds.get() + 1);
        Ok(SinusoidTextEncoder)
    }

    fn image_encoder(
        &self,
        _config: &PipelineConfig,
        _device: &<TestBackend as Backend>::Device,
    ) -> Result<BlockMeanEncoder, PipelineError> {
        self.builds.set(self.builds.get() + 1);
        Ok(BlockMeanEncoder)
    }

    fn decoder(
        &self,
        _config: &PipelineConfig,
        _device: &<TestBackend as Backend>::Device,
    ) -> Result<UpsampleDecoder, PipelineError> {
        self.builds.set(self.builds.get() + 1);
        if self.fail_decoder {
            return Err(PipelineError::Component("decoder weights missing".into()));
        }
        Ok(UpsampleDecoder)
    }

    fn denoiser(
        &self,
        _config: &PipelineConfig,
        device: &<TestBackend as Backend>::Device,
    ) -> Result<SpatialDenoiser<TestBackend>, PipelineError> {
        self.builds.set(self.builds.get() + 1);
        Ok(SpatialDenoiserConfig::tiny(CONTEXT_DIM).init(device))
    }
}

pub type TestPipeline = StableDiffusion<TestBackend, TinyFactory>;

/// 128x128 images, 16x16 latents
pub fn pipeline() -> TestPipeline {
    pipeline_with(TinyFactory::default())
}

pub fn pipeline_with(factory: TinyFactory) -> TestPipeline {
    StableDiffusion::new(factory, PipelineConfig::new(128, 128), &Default::default())
}

/// A prompt of `words` distinct words
pub fn long_prompt(words: usize) -> String {
    (0..words)
        .map(|i| format!("w{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Horizontal gradient image `[1, 3, 128, 128]` in [0, 255]
pub fn gradient_image() -> Tensor<TestBackend, 4> {
    let mut values = Vec::with_capacity(3 * 128 * 128);
    for c in 0..3 {
        for _y in 0..128 {
            for x in 0..128 {
                values.push(((x * 2 + c * 40) % 256) as f32);
            }
        }
    }
    Tensor::from_data(TensorData::new(values, [1, 3, 128, 128]), &Default::default())
}

pub fn max_byte_diff(a: &[u8], b: &[u8]) -> u8 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x.abs_diff(*y)).max().unwrap_or(0)
}
