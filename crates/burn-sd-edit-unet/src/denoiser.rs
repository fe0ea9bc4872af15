//! Denoising network contract and a compact spatial-transformer denoiser

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;

use crate::blocks::{ResBlock, SpatialTransformer, SpatialTransformerConfig};
use crate::interception::{AttentionLayerId, InterceptionError, InterceptionPolicy};
use crate::norm::{silu, GroupNorm};

/// Noise predictor with per-attention-layer interception points
pub trait DenoisingNetwork<B: Backend> {
    /// Predict the noise in `latent`
    ///
    /// # Arguments
    ///
    /// * `latent` - `[batch, 4, height / 8, width / 8]`
    /// * `t_emb` - Timestep embedding `[batch, 320]`
    /// * `context` - Text context `[batch, 77, context_dim]`
    /// * `policy` - Consulted by every attention layer during this pass
    ///
    /// # Returns
    ///
    /// Noise estimate with the same shape as `latent`
    fn predict(
        &self,
        latent: Tensor<B, 4>,
        t_emb: Tensor<B, 2>,
        context: Tensor<B, 3>,
        policy: &mut dyn InterceptionPolicy<B>,
    ) -> Result<Tensor<B, 4>, InterceptionError>;

    /// Identities of every attention layer, in forward order
    fn attention_layers(&self) -> Vec<AttentionLayerId>;
}

/// Configuration for [`SpatialDenoiser`]
#[derive(Debug, Clone)]
pub struct SpatialDenoiserConfig {
    /// Latent channels
    pub in_channels: usize,
    pub model_channels: usize,
    pub num_groups: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// Text embedding width
    pub context_dim: usize,
    /// Width of the incoming sinusoidal timestep embedding
    pub time_embed_dim: usize,
    /// Number of (ResBlock, SpatialTransformer) stages
    pub num_stages: usize,
    /// Transformer blocks per spatial transformer
    pub transformer_depth: usize,
}

impl SpatialDenoiserConfig {
    /// Small configuration for tests and CPU experiments
    pub fn tiny(context_dim: usize) -> Self {
        Self {
            in_channels: 4,
            model_channels: 16,
            num_groups: 4,
            num_heads: 2,
            head_dim: 8,
            context_dim,
            time_embed_dim: 320,
            num_stages: 2,
            transformer_depth: 1,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SpatialDenoiser<B> {
        SpatialDenoiser::new(self, device)
    }
}

/// One residual block followed by one spatial transformer
#[derive(Module, Debug)]
pub struct DenoiserStage<B: Backend> {
    res: ResBlock<B>,
    transformer: SpatialTransformer<B>,
}

/// Single-resolution denoiser: conv in, (res block, spatial transformer) stages, conv out
#[derive(Module, Debug)]
pub struct SpatialDenoiser<B: Backend> {
    time_embed_0: Linear<B>,
    time_embed_2: Linear<B>,
    conv_in: Conv2d<B>,
    stages: Vec<DenoiserStage<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
}

impl<B: Backend> SpatialDenoiser<B> {
    pub fn new(config: &SpatialDenoiserConfig, device: &B::Device) -> Self {
        let ch = config.model_channels;
        let time_dim = ch * 4;

        let transformer_config = SpatialTransformerConfig {
            channels: ch,
            num_groups: config.num_groups,
            num_heads: config.num_heads,
            head_dim: config.head_dim,
            context_dim: config.context_dim,
            depth: config.transformer_depth,
        };

        let stages = (0..config.num_stages)
            .map(|i| DenoiserStage {
                res: ResBlock::new(ch, config.num_groups, time_dim, device),
                transformer: SpatialTransformer::new(
                    &transformer_config,
                    i * config.transformer_depth,
                    device,
                ),
            })
            .collect();

        let conv3 = |in_ch, out_ch| {
            Conv2dConfig::new([in_ch, out_ch], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            time_embed_0: LinearConfig::new(config.time_embed_dim, time_dim).init(device),
            time_embed_2: LinearConfig::new(time_dim, time_dim).init(device),
            conv_in: conv3(config.in_channels, ch),
            stages,
            norm_out: GroupNorm::new(config.num_groups, ch, device),
            conv_out: conv3(ch, config.in_channels),
        }
    }
}

impl<B: Backend> DenoisingNetwork<B> for SpatialDenoiser<B> {
    fn predict(
        &self,
        latent: Tensor<B, 4>,
        t_emb: Tensor<B, 2>,
        context: Tensor<B, 3>,
        policy: &mut dyn InterceptionPolicy<B>,
    ) -> Result<Tensor<B, 4>, InterceptionError> {
        let emb = self.time_embed_2.forward(silu(self.time_embed_0.forward(t_emb)));

        let mut h = self.conv_in.forward(latent);
        for stage in &self.stages {
            h = stage.res.forward(h, emb.clone());
            h = stage.transformer.forward(h, context.clone(), policy)?;
        }

        Ok(self.conv_out.forward(silu(self.norm_out.forward(h))))
    }

    fn attention_layers(&self) -> Vec<AttentionLayerId> {
        self.stages
            .iter()
            .flat_map(|stage| stage.transformer.attention_layers())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::{AttentionControl, AttentionKind, InterceptionMode, Passthrough};
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;
    use burn_sd_edit_samplers::timestep_embedding;

    type TestBackend = NdArray<f32>;

    fn inputs(
        device: &<TestBackend as Backend>::Device,
    ) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 2>, Tensor<TestBackend, 3>) {
        let latent = Tensor::random([2, 4, 4, 4], Distribution::Normal(0.0, 1.0), device);
        let t_emb = timestep_embedding(981, 2, 320, device);
        let context = Tensor::random([2, 77, 12], Distribution::Normal(0.0, 1.0), device);
        (latent, t_emb, context)
    }

    #[test]
    fn test_prediction_matches_latent_shape() {
        let device = Default::default();
        let model = SpatialDenoiserConfig::tiny(12).init::<TestBackend>(&device);
        let (latent, t_emb, context) = inputs(&device);

        let noise = model.predict(latent, t_emb, context, &mut Passthrough).unwrap();
        assert_eq!(noise.dims(), [2, 4, 4, 4]);
    }

    #[test]
    fn test_attention_layer_registry() {
        let device = Default::default();
        let model = SpatialDenoiserConfig::tiny(12).init::<TestBackend>(&device);
        let layers = model.attention_layers();

        assert_eq!(layers.len(), 4);
        assert_eq!(
            layers.iter().filter(|l| l.kind == AttentionKind::CrossAttention).count(),
            2
        );
        let mut sorted = layers.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), layers.len());
    }

    #[test]
    fn test_unregistered_control_fails_fast() {
        let device = Default::default();
        let model = SpatialDenoiserConfig::tiny(12).init::<TestBackend>(&device);
        let (latent, t_emb, context) = inputs(&device);

        // control that only knows the first block
        let mut control = AttentionControl::new(AttentionLayerId::pair(0));
        control.set_mode_all(InterceptionMode::Unconditional);
        let result = model.predict(latent, t_emb, context, &mut control);
        assert!(matches!(result, Err(InterceptionError::UnregisteredLayer(_))));
    }
}
