//! Run configuration
//!
//! All configs deserialize from JSON with missing fields taking their defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UsageError;

/// The denoiser works on multiples of 2^7 pixels
pub const SIZE_MULTIPLE: usize = 128;

/// Output image size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub img_height: usize,
    pub img_width: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            img_height: 512,
            img_width: 512,
        }
    }
}

impl PipelineConfig {
    pub fn new(img_height: usize, img_width: usize) -> Self {
        Self {
            img_height,
            img_width,
        }
    }

    /// Round both sides to the nearest multiple of 128 (ties to even, never below 128)
    pub fn rounded(self) -> Self {
        Self {
            img_height: round_to_multiple(self.img_height),
            img_width: round_to_multiple(self.img_width),
        }
    }

    /// Latent height and width
    pub fn latent_size(&self) -> [usize; 2] {
        [self.img_height / 8, self.img_width / 8]
    }
}

fn round_to_multiple(value: usize) -> usize {
    let multiples = (value as f64 / SIZE_MULTIPLE as f64).round_ties_even() as usize;
    multiples.max(1) * SIZE_MULTIPLE
}

/// Debug flags for pipeline diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log latent statistics for the first steps
    pub sampler: bool,
    /// Fail with `NonFinite` on NaN/Inf after each network call and step
    pub nan: bool,
}

/// Plain text-to-image generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    pub batch_size: usize,
    pub num_steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
    pub debug: DebugConfig,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_steps: 50,
            guidance_scale: 7.5,
            seed: None,
            negative_prompt: None,
            debug: DebugConfig::default(),
        }
    }
}

/// Prompt-to-prompt editing method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EditMethod {
    /// Swap words; cross-attention maps of the original prompt are reused
    Replace,
    /// Add or change words; aligned tokens keep the original maps
    Refine,
    /// Scale the attention of selected tokens
    Reweight,
}

impl EditMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditMethod::Replace => "replace",
            EditMethod::Refine => "refine",
            EditMethod::Reweight => "reweight",
        }
    }
}

impl fmt::Display for EditMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EditMethod {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(EditMethod::Replace),
            "refine" => Ok(EditMethod::Refine),
            "reweight" => Ok(EditMethod::Reweight),
            other => Err(UsageError::UnknownEditMethod(other.to_string())),
        }
    }
}

impl TryFrom<String> for EditMethod {
    type Error = UsageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EditMethod> for String {
    fn from(method: EditMethod) -> Self {
        method.as_str().to_string()
    }
}

/// Range of `t_scale = 1 - timestep / 1000` in which an edit is active
///
/// Both ends are inclusive. Deserializes from `0.6` (meaning `[0.0, 0.6]`) or
/// from `[0.2, 0.6]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "WindowRepr", into = "WindowRepr")]
pub struct AttentionWindow {
    pub start: f64,
    pub end: f64,
}

impl AttentionWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// `[0.0, end]`
    pub fn until(end: f64) -> Self {
        Self::new(0.0, end)
    }

    /// Every step
    pub fn always() -> Self {
        Self::new(0.0, 1.0)
    }

    pub fn contains(&self, t_scale: f64) -> bool {
        self.start <= t_scale && t_scale <= self.end
    }
}

impl From<f64> for AttentionWindow {
    fn from(end: f64) -> Self {
        Self::until(end)
    }
}

impl From<(f64, f64)> for AttentionWindow {
    fn from((start, end): (f64, f64)) -> Self {
        Self::new(start, end)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WindowRepr {
    Until(f64),
    Range(f64, f64),
}

impl From<WindowRepr> for AttentionWindow {
    fn from(repr: WindowRepr) -> Self {
        match repr {
            WindowRepr::Until(end) => Self::until(end),
            WindowRepr::Range(start, end) => Self::new(start, end),
        }
    }
}

impl From<AttentionWindow> for WindowRepr {
    fn from(window: AttentionWindow) -> Self {
        WindowRepr::Range(window.start, window.end)
    }
}

/// Prompt-to-prompt editing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditConfig {
    pub method: EditMethod,
    /// Steps in which self-attention maps of the original prompt are reused
    pub self_attn_window: AttentionWindow,
    /// Steps in which cross-attention is edited according to `method`
    pub cross_attn_window: AttentionWindow,
    /// One multiplier per token of the edited prompt, see
    /// [`create_attention_weights`](crate::StableDiffusion::create_attention_weights)
    #[serde(default)]
    pub edit_weights: Option<Vec<f32>>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub debug: DebugConfig,
}

impl EditConfig {
    pub fn new(
        method: EditMethod,
        self_attn_window: impl Into<AttentionWindow>,
        cross_attn_window: impl Into<AttentionWindow>,
    ) -> Self {
        Self {
            method,
            self_attn_window: self_attn_window.into(),
            cross_attn_window: cross_attn_window.into(),
            edit_weights: None,
            negative_prompt: None,
            num_steps: default_num_steps(),
            guidance_scale: default_guidance_scale(),
            batch_size: default_batch_size(),
            seed: None,
            debug: DebugConfig::default(),
        }
    }

    /// Edit weights, treating an empty vector as absent
    pub fn weights(&self) -> Option<&[f32]> {
        self.edit_weights.as_deref().filter(|w| !w.is_empty())
    }
}

fn default_num_steps() -> usize {
    50
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_batch_size() -> usize {
    1
}

/// Inpainting run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InpaintConfig {
    /// Times each step is redone with the known region re-noised
    pub num_resamples: usize,
    pub num_steps: usize,
    pub guidance_scale: f64,
    pub batch_size: usize,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
    pub debug: DebugConfig,
}

impl Default for InpaintConfig {
    fn default() -> Self {
        Self {
            num_resamples: 1,
            num_steps: 25,
            guidance_scale: 7.5,
            batch_size: 1,
            seed: None,
            negative_prompt: None,
            debug: DebugConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_config_default() {
        let config = GenerateConfig::default();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.num_steps, 50);
        assert_eq!(config.guidance_scale, 7.5);
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_inpaint_config_default() {
        let config = InpaintConfig::default();
        assert_eq!(config.num_resamples, 1);
        assert_eq!(config.num_steps, 25);
    }

    #[test]
    fn test_size_rounding() {
        assert_eq!(PipelineConfig::new(512, 512).rounded(), PipelineConfig::new(512, 512));
        assert_eq!(PipelineConfig::new(500, 700).rounded(), PipelineConfig::new(512, 640));
        // 320 / 128 = 2.5 rounds to even
        assert_eq!(PipelineConfig::new(320, 448).rounded(), PipelineConfig::new(256, 512));
        assert_eq!(PipelineConfig::new(10, 10).rounded(), PipelineConfig::new(128, 128));
        assert_eq!(PipelineConfig::new(256, 384).latent_size(), [32, 48]);
    }

    #[test]
    fn test_edit_method_parsing() {
        assert_eq!("refine".parse::<EditMethod>(), Ok(EditMethod::Refine));
        assert_eq!(
            "swap".parse::<EditMethod>(),
            Err(UsageError::UnknownEditMethod("swap".into()))
        );
    }

    #[test]
    fn test_window_is_inclusive() {
        let window = AttentionWindow::new(0.2, 0.6);
        assert!(window.contains(0.2));
        assert!(window.contains(0.6));
        assert!(!window.contains(0.600001));
        assert!(!window.contains(0.199999));
        assert_eq!(AttentionWindow::from(0.4), AttentionWindow::new(0.0, 0.4));
    }

    #[test]
    fn test_empty_weights_are_absent() {
        let mut config = EditConfig::new(EditMethod::Reweight, 0.2, 0.8);
        assert!(config.weights().is_none());
        config.edit_weights = Some(vec![]);
        assert!(config.weights().is_none());
        config.edit_weights = Some(vec![1.0; 77]);
        assert_eq!(config.weights().map(<[f32]>::len), Some(77));
    }
}
