//! Sinusoidal timestep embedding

use burn::prelude::*;

/// Width of the timestep embedding fed to the denoiser
pub const TIMESTEP_EMBEDDING_DIM: usize = 320;

/// Longest period of the sinusoids
pub const MAX_PERIOD: f64 = 10000.0;

/// Embed one timestep as `[cos(t * f), sin(t * f)]`, repeated over the batch
///
/// `f_i = exp(-ln(max_period) * i / (dim / 2))` for `i` in `0..dim / 2`.
/// Returns `[batch_size, dim]`.
pub fn timestep_embedding<B: Backend>(
    timestep: usize,
    batch_size: usize,
    dim: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let half = dim / 2;
    let log_period = MAX_PERIOD.ln() as f32;
    let t = timestep as f32;

    let args: Vec<f32> = (0..half)
        .map(|i| t * (-log_period * i as f32 / half as f32).exp())
        .collect();

    let mut embedding = Vec::with_capacity(half * 2);
    embedding.extend(args.iter().map(|a| a.cos()));
    embedding.extend(args.iter().map(|a| a.sin()));

    Tensor::<B, 2>::from_data(TensorData::new(embedding, [1, half * 2]), device)
        .repeat_dim(0, batch_size)
}
