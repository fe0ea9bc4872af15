//! Seeded Gaussian noise
//!
//! Noise is drawn on the host from a [`StdRng`] so that a given seed yields
//! the same latent on every backend.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Build the RNG for a run: seeded when a seed is given, from entropy otherwise
pub fn noise_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Draw a standard-normal tensor of the given shape
pub fn gaussian_noise<B: Backend, const D: usize>(
    shape: [usize; D],
    rng: &mut StdRng,
    device: &B::Device,
) -> Tensor<B, D> {
    let numel = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}
