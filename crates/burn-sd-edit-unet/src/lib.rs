//! Attention layers with interception hooks for prompt-to-prompt editing
//!
//! Every attention layer exposes its softmax weights to an injected
//! [`InterceptionPolicy`]. [`AttentionControl`] is the per-layer state
//! machine used by the editing loop; [`Passthrough`] leaves attention alone.

pub mod blocks;
pub mod denoiser;
pub mod interception;
pub mod norm;

pub use blocks::{
    FeedForward, InterceptedAttention, ResBlock, SpatialTransformer, SpatialTransformerConfig,
    TransformerBlock,
};
pub use denoiser::{DenoisingNetwork, SpatialDenoiser, SpatialDenoiserConfig};
pub use interception::{
    AttentionControl, AttentionKind, AttentionLayerId, InterceptionError, InterceptionMode,
    InterceptionPolicy, InterceptionState, Passthrough,
};
