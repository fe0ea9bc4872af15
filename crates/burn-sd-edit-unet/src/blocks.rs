//! Transformer building blocks with intercepted attention
//!
//! Attention layers carry an [`AttentionLayerId`] and route their softmax
//! weights through the [`InterceptionPolicy`] passed into `forward`.

use burn::module::Ignored;
use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;

use crate::interception::{AttentionLayerId, InterceptionError, InterceptionPolicy};
use crate::norm::{silu, GroupNorm, LayerNorm};

/// Multi-head attention whose weights pass through an interception policy
///
/// Self-attention when `forward` gets no context, cross-attention otherwise.
#[derive(Module, Debug)]
pub struct InterceptedAttention<B: Backend> {
    to_q: Linear<B>,
    to_k: Linear<B>,
    to_v: Linear<B>,
    to_out: Linear<B>,
    num_heads: usize,
    head_dim: usize,
    layer: Ignored<AttentionLayerId>,
}

impl<B: Backend> InterceptedAttention<B> {
    /// Creates a new attention layer
    ///
    /// # Arguments
    ///
    /// * `layer` - Identity reported to the interception policy
    /// * `query_dim` - Dimension of query input
    /// * `num_heads` - Number of attention heads
    /// * `head_dim` - Dimension per attention head
    /// * `context_dim` - Dimension of key/value context (None for self-attention)
    /// * `device` - Device to create tensors on
    pub fn new(
        layer: AttentionLayerId,
        query_dim: usize,
        num_heads: usize,
        head_dim: usize,
        context_dim: Option<usize>,
        device: &B::Device,
    ) -> Self {
        let inner_dim = num_heads * head_dim;
        let context_dim = context_dim.unwrap_or(query_dim);

        Self {
            to_q: LinearConfig::new(query_dim, inner_dim).with_bias(false).init(device),
            to_k: LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device),
            to_v: LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device),
            to_out: LinearConfig::new(inner_dim, query_dim).init(device),
            num_heads,
            head_dim,
            layer: Ignored(layer),
        }
    }

    pub fn layer(&self) -> AttentionLayerId {
        *self.layer
    }

    /// Scaled dot-product attention with an interception point after softmax
    ///
    /// # Arguments
    ///
    /// * `x` - Query input of shape `[batch, seq_len, query_dim]`
    /// * `context` - Key/value context (None uses x for self-attention)
    /// * `policy` - Receives `[batch, heads, seq_len, ctx_len]` weights
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<Tensor<B, 3>>,
        policy: &mut dyn InterceptionPolicy<B>,
    ) -> Result<Tensor<B, 3>, InterceptionError> {
        let context = context.unwrap_or_else(|| x.clone());

        let [b, seq_len, _] = x.dims();
        let [_, ctx_len, _] = context.dims();

        let q = self.to_q.forward(x);
        let k = self.to_k.forward(context.clone());
        let v = self.to_v.forward(context);

        // [b, seq, heads*dim] -> [b, heads, seq, dim]
        let q = q.reshape([b, seq_len, self.num_heads, self.head_dim]).swap_dims(1, 2);
        let k = k.reshape([b, ctx_len, self.num_heads, self.head_dim]).swap_dims(1, 2);
        let v = v.reshape([b, ctx_len, self.num_heads, self.head_dim]).swap_dims(1, 2);

        let scale = (self.head_dim as f64).powf(-0.5);
        let scores = q.matmul(k.transpose()) * scale;
        let weights = burn::tensor::activation::softmax(scores, 3);

        let weights = policy.intercept(*self.layer, weights)?;
        let out = weights.matmul(v);

        // [b, heads, seq, dim] -> [b, seq, heads*dim]
        let out = out.swap_dims(1, 2).reshape([b, seq_len, self.num_heads * self.head_dim]);

        Ok(self.to_out.forward(out))
    }
}

/// Feed-forward network with GEGLU activation
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    net_0: Linear<B>,
    net_2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(dim: usize, mult_dim: usize, device: &B::Device) -> Self {
        // GEGLU doubles the projection size
        Self {
            net_0: LinearConfig::new(dim, mult_dim * 2).init(device),
            net_2: LinearConfig::new(mult_dim, dim).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.net_0.forward(x);

        let [b, s, d] = hidden.dims();
        let half = d / 2;
        let x = hidden.clone().slice([0..b, 0..s, 0..half]);
        let gate = hidden.slice([0..b, 0..s, half..d]);

        self.net_2.forward(x * burn::tensor::activation::gelu(gate))
    }
}

/// Self-attention, cross-attention and FFN, each with a residual
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn1: InterceptedAttention<B>,
    norm2: LayerNorm<B>,
    attn2: InterceptedAttention<B>,
    norm3: LayerNorm<B>,
    ff: FeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    /// Creates block number `index`; its layers are `AttentionLayerId::pair(index)`
    pub fn new(
        index: usize,
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        context_dim: usize,
        device: &B::Device,
    ) -> Self {
        let [self_id, cross_id] = AttentionLayerId::pair(index);
        Self {
            norm1: LayerNorm::new(dim, device),
            attn1: InterceptedAttention::new(self_id, dim, num_heads, head_dim, None, device),
            norm2: LayerNorm::new(dim, device),
            attn2: InterceptedAttention::new(
                cross_id,
                dim,
                num_heads,
                head_dim,
                Some(context_dim),
                device,
            ),
            norm3: LayerNorm::new(dim, device),
            ff: FeedForward::new(dim, dim * 4, device),
        }
    }

    pub fn attention_layers(&self) -> [AttentionLayerId; 2] {
        [self.attn1.layer(), self.attn2.layer()]
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Tensor<B, 3>,
        policy: &mut dyn InterceptionPolicy<B>,
    ) -> Result<Tensor<B, 3>, InterceptionError> {
        let x = x.clone() + self.attn1.forward(self.norm1.forward(x), None, policy)?;
        let x = x.clone() + self.attn2.forward(self.norm2.forward(x), Some(context), policy)?;
        Ok(x.clone() + self.ff.forward(self.norm3.forward(x)))
    }
}

/// Spatial transformer: runs transformer blocks over the flattened feature map
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    norm: GroupNorm<B>,
    proj_in: Conv2d<B>,
    transformer_blocks: Vec<TransformerBlock<B>>,
    proj_out: Conv2d<B>,
}

/// Shape parameters of a [`SpatialTransformer`]
#[derive(Debug, Clone)]
pub struct SpatialTransformerConfig {
    pub channels: usize,
    pub num_groups: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub context_dim: usize,
    pub depth: usize,
}

impl<B: Backend> SpatialTransformer<B> {
    /// Creates a spatial transformer whose blocks are numbered from `first_block`
    pub fn new(config: &SpatialTransformerConfig, first_block: usize, device: &B::Device) -> Self {
        let inner_dim = config.num_heads * config.head_dim;

        let transformer_blocks = (0..config.depth)
            .map(|i| {
                TransformerBlock::new(
                    first_block + i,
                    inner_dim,
                    config.num_heads,
                    config.head_dim,
                    config.context_dim,
                    device,
                )
            })
            .collect();

        Self {
            norm: GroupNorm::new(config.num_groups, config.channels, device),
            proj_in: Conv2dConfig::new([config.channels, inner_dim], [1, 1]).init(device),
            transformer_blocks,
            proj_out: Conv2dConfig::new([inner_dim, config.channels], [1, 1]).init(device),
        }
    }

    pub fn attention_layers(&self) -> Vec<AttentionLayerId> {
        self.transformer_blocks
            .iter()
            .flat_map(|block| block.attention_layers())
            .collect()
    }

    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, channels, height, width]`
    /// * `context` - Text embedding context of shape `[batch, seq_len, context_dim]`
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        context: Tensor<B, 3>,
        policy: &mut dyn InterceptionPolicy<B>,
    ) -> Result<Tensor<B, 4>, InterceptionError> {
        let [b, _, h, w] = x.dims();
        let residual = x.clone();

        let x = self.proj_in.forward(self.norm.forward(x));

        // [b, c, h, w] -> [b, h*w, c]
        let inner_dim = x.dims()[1];
        let mut x = x.reshape([b, inner_dim, h * w]).swap_dims(1, 2);

        for block in &self.transformer_blocks {
            x = block.forward(x, context.clone(), policy)?;
        }

        let x = x.swap_dims(1, 2).reshape([b, inner_dim, h, w]);
        Ok(self.proj_out.forward(x) + residual)
    }
}

/// Residual conv block conditioned on the timestep embedding
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv2d<B>,
    time_emb_proj: Linear<B>,
    norm2: GroupNorm<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> ResBlock<B> {
    pub fn new(channels: usize, num_groups: usize, time_emb_dim: usize, device: &B::Device) -> Self {
        let conv = || {
            Conv2dConfig::new([channels, channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        Self {
            norm1: GroupNorm::new(num_groups, channels, device),
            conv1: conv(),
            time_emb_proj: LinearConfig::new(time_emb_dim, channels).init(device),
            norm2: GroupNorm::new(num_groups, channels, device),
            conv2: conv(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, time_emb: Tensor<B, 2>) -> Tensor<B, 4> {
        let [b, c, _, _] = x.dims();
        let residual = x.clone();

        let hidden = self.conv1.forward(silu(self.norm1.forward(x)));
        let time_emb = self.time_emb_proj.forward(silu(time_emb)).reshape([b, c, 1, 1]);
        let hidden = hidden + time_emb;
        let hidden = self.conv2.forward(silu(self.norm2.forward(hidden)));

        hidden + residual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::{AttentionControl, AttentionKind, InterceptionMode, Passthrough};
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Records which layers were visited, in order
    #[derive(Default)]
    struct Recorder {
        seen: Vec<(AttentionLayerId, [usize; 4])>,
    }

    impl InterceptionPolicy<TestBackend> for Recorder {
        fn intercept(
            &mut self,
            layer: AttentionLayerId,
            weights: Tensor<TestBackend, 4>,
        ) -> Result<Tensor<TestBackend, 4>, InterceptionError> {
            self.seen.push((layer, weights.dims()));
            Ok(weights)
        }
    }

    fn config() -> SpatialTransformerConfig {
        SpatialTransformerConfig {
            channels: 8,
            num_groups: 4,
            num_heads: 2,
            head_dim: 4,
            context_dim: 6,
            depth: 2,
        }
    }

    #[test]
    fn test_policy_sees_every_layer_in_order() {
        let device = Default::default();
        let transformer = SpatialTransformer::<TestBackend>::new(&config(), 3, &device);
        let x = Tensor::random([1, 8, 2, 3], Distribution::Normal(0.0, 1.0), &device);
        let context = Tensor::random([1, 5, 6], Distribution::Normal(0.0, 1.0), &device);

        let mut recorder = Recorder::default();
        let out = transformer.forward(x, context, &mut recorder).unwrap();
        assert_eq!(out.dims(), [1, 8, 2, 3]);

        let expected: Vec<_> = [3, 4]
            .into_iter()
            .flat_map(AttentionLayerId::pair)
            .collect();
        let seen: Vec<_> = recorder.seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(seen, expected);
        assert_eq!(transformer.attention_layers(), expected);

        // self-attention is 6x6 over positions, cross-attention 6x5 over tokens
        assert_eq!(recorder.seen[0].1, [1, 2, 6, 6]);
        assert_eq!(recorder.seen[1].1, [1, 2, 6, 5]);
    }

    #[test]
    fn test_save_use_last_reproduces_output() {
        let device = Default::default();
        let transformer = SpatialTransformer::<TestBackend>::new(&config(), 0, &device);
        let x = Tensor::random([1, 8, 2, 2], Distribution::Normal(0.0, 1.0), &device);
        let context = Tensor::random([1, 5, 6], Distribution::Normal(0.0, 1.0), &device);

        let mut control = AttentionControl::new(transformer.attention_layers());
        control.set_mode_all(InterceptionMode::Save);
        let saved = transformer.forward(x.clone(), context.clone(), &mut control).unwrap();

        let plain = transformer.forward(x.clone(), context.clone(), &mut Passthrough).unwrap();
        let diff: f32 = (saved.clone() - plain).abs().max().into_scalar();
        assert!(diff < 1e-6);

        // Replaying cached maps with the same inputs gives the same output
        control.set_mode_all(InterceptionMode::UseLast);
        let replayed = transformer.forward(x, context, &mut control).unwrap();
        let diff: f32 = (saved - replayed).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_res_block_keeps_shape() {
        let device = Default::default();
        let block = ResBlock::<TestBackend>::new(8, 4, 16, &device);
        let x = Tensor::random([2, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let t = Tensor::random([2, 16], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x, t).dims(), [2, 8, 4, 4]);
    }

    #[test]
    fn test_attention_kinds() {
        let device = Default::default();
        let block = TransformerBlock::<TestBackend>::new(5, 8, 2, 4, 6, &device);
        let [a, b] = block.attention_layers();
        assert_eq!(a.kind, AttentionKind::SelfAttention);
        assert_eq!(b.kind, AttentionKind::CrossAttention);
        assert_eq!(a.block, 5);
    }
}
