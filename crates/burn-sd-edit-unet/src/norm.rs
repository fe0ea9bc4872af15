//! Normalization layers and activations used by the denoiser blocks

use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// Group normalization over `[batch, channels, height, width]`
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    pub num_groups: usize,
    /// Scale, shape [channels]
    pub weight: Tensor<B, 1>,
    /// Shift, shape [channels]
    pub bias: Tensor<B, 1>,
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    pub fn new(num_groups: usize, num_channels: usize, device: &B::Device) -> Self {
        Self {
            num_groups,
            weight: Tensor::ones([num_channels], device),
            bias: Tensor::zeros([num_channels], device),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;

        let x = x.reshape([batch, self.num_groups, group_size * height * width]);
        let mean = x.clone().mean_dim(2);
        let centered = x - mean;
        let var = centered.clone().powf_scalar(2.0).mean_dim(2);
        let x = centered / (var + self.eps).sqrt();

        let x = x.reshape([batch, channels, height, width]);
        let weight = self.weight.clone().reshape([1, channels, 1, 1]);
        let bias = self.bias.clone().reshape([1, channels, 1, 1]);

        x * weight + bias
    }
}

/// Layer normalization over the last dimension
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    pub weight: Tensor<B, 1>,
    pub bias: Tensor<B, 1>,
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Tensor::ones([size], device),
            bias: Tensor::zeros([size], device),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [_, _, size] = x.dims();

        let mean = x.clone().mean_dim(2);
        let centered = x - mean;
        let var = centered.clone().powf_scalar(2.0).mean_dim(2);
        let x = centered / (var + self.eps).sqrt();

        x * self.weight.clone().reshape([1, 1, size]) + self.bias.clone().reshape([1, 1, size])
    }
}

/// SiLU activation: x * sigmoid(x)
pub fn silu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x)
}
