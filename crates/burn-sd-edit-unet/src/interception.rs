//! Attention interception
//!
//! Every attention layer in the denoiser hands its softmax weights to an
//! [`InterceptionPolicy`] before multiplying them with the values. The policy
//! may pass the weights through, cache them, or substitute an edited map.
//!
//! [`AttentionControl`] is the stateful policy used for prompt editing: it owns
//! one [`InterceptionState`] per registered layer, keyed by
//! [`AttentionLayerId`], and is driven exclusively through its setters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use thiserror::Error;

/// Which of the two attention layers in a transformer block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttentionKind {
    /// `attn1`: image positions attend to each other
    SelfAttention,
    /// `attn2`: image positions attend to text tokens
    CrossAttention,
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionKind::SelfAttention => write!(f, "attn1"),
            AttentionKind::CrossAttention => write!(f, "attn2"),
        }
    }
}

/// Stable identity of one attention layer inside a denoiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttentionLayerId {
    /// Index of the transformer block, in forward order
    pub block: usize,
    pub kind: AttentionKind,
}

impl AttentionLayerId {
    pub fn new(block: usize, kind: AttentionKind) -> Self {
        Self { block, kind }
    }

    /// The (self, cross) pair of a transformer block
    pub fn pair(block: usize) -> [Self; 2] {
        [
            Self::new(block, AttentionKind::SelfAttention),
            Self::new(block, AttentionKind::CrossAttention),
        ]
    }
}

impl fmt::Display for AttentionLayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}.{}", self.block, self.kind)
    }
}

/// How a layer treats its attention weights during the next forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterceptionMode {
    /// Neutral baseline
    #[default]
    None,
    /// Cache the weights, pass them through
    Save,
    /// Replace the weights with the cached map
    UseLast,
    /// Blend cached columns gathered at the edit indices with the current weights
    Edit,
    /// Use the current (edited prompt) weights
    Injection,
    /// Standard attention for the unconditional pass
    Unconditional,
}

impl InterceptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterceptionMode::None => "none",
            InterceptionMode::Save => "save",
            InterceptionMode::UseLast => "use_last",
            InterceptionMode::Edit => "edit",
            InterceptionMode::Injection => "injection",
            InterceptionMode::Unconditional => "unconditional",
        }
    }
}

impl fmt::Display for InterceptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterceptionMode {
    type Err = InterceptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(InterceptionMode::None),
            "save" => Ok(InterceptionMode::Save),
            "use_last" => Ok(InterceptionMode::UseLast),
            "edit" => Ok(InterceptionMode::Edit),
            "injection" => Ok(InterceptionMode::Injection),
            "unconditional" => Ok(InterceptionMode::Unconditional),
            other => Err(InterceptionError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterceptionError {
    #[error("unknown interception mode '{0}'")]
    UnknownMode(String),

    #[error("attention layer {0} is not registered")]
    UnregisteredLayer(AttentionLayerId),

    #[error("layer {layer} is in '{mode}' mode but has no cached attention map")]
    MissingCachedMap {
        layer: AttentionLayerId,
        mode: InterceptionMode,
    },

    #[error("layer {layer}: cached map has shape {cached:?}, current weights have {current:?}")]
    ShapeMismatch {
        layer: AttentionLayerId,
        cached: Vec<usize>,
        current: Vec<usize>,
    },

    #[error("layer {layer}: {what} has {actual} entries, expected {expected}")]
    EditLength {
        layer: AttentionLayerId,
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Hook called by every attention layer with its raw softmax weights
///
/// Weights are `[batch, heads, queries, keys]`. The returned tensor must have
/// the same shape and replaces the weights for the rest of the forward pass.
pub trait InterceptionPolicy<B: Backend> {
    fn intercept(
        &mut self,
        layer: AttentionLayerId,
        weights: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, InterceptionError>;
}

/// Leaves every attention map untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl<B: Backend> InterceptionPolicy<B> for Passthrough {
    fn intercept(
        &mut self,
        _layer: AttentionLayerId,
        weights: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, InterceptionError> {
        Ok(weights)
    }
}

/// Per-layer interception record
#[derive(Debug, Clone)]
pub struct InterceptionState<B: Backend> {
    pub mode: InterceptionMode,
    /// Weights stored by the last `Save` pass
    pub cached_map: Option<Tensor<B, 4>>,
    /// Per-key blend mask for `Edit`, 1.0 where the cached map is used
    pub edit_mask: Option<Tensor<B, 1>>,
    /// Per-key column of the cached map to gather for `Edit`
    pub edit_indices: Option<Tensor<B, 1, Int>>,
    /// Per-key multiplier applied when `use_weights` is set
    pub edit_weights: Option<Tensor<B, 1>>,
    pub use_weights: bool,
}

impl<B: Backend> Default for InterceptionState<B> {
    fn default() -> Self {
        Self {
            mode: InterceptionMode::None,
            cached_map: None,
            edit_mask: None,
            edit_indices: None,
            edit_weights: None,
            use_weights: false,
        }
    }
}

impl<B: Backend> InterceptionState<B> {
    /// True when nothing from a previous run is left behind
    pub fn is_neutral(&self) -> bool {
        self.mode == InterceptionMode::None
            && self.cached_map.is_none()
            && self.edit_mask.is_none()
            && self.edit_indices.is_none()
            && self.edit_weights.is_none()
            && !self.use_weights
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Resolve the effective weights for one forward pass of `layer`
    pub fn apply(
        &mut self,
        layer: AttentionLayerId,
        weights: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, InterceptionError> {
        let weights = match self.mode {
            InterceptionMode::None
            | InterceptionMode::Injection
            | InterceptionMode::Unconditional => weights,
            InterceptionMode::Save => {
                self.cached_map = Some(weights.clone());
                weights
            }
            InterceptionMode::UseLast => {
                let cached = self.cached(layer)?;
                let dims = weights.dims();
                check_numel(layer, &cached.dims(), &dims)?;
                cached.reshape(dims)
            }
            InterceptionMode::Edit => self.edit(layer, weights)?,
        };

        match (&self.edit_weights, self.use_weights) {
            (Some(scale), true) => {
                let dims = weights.dims();
                let [n] = scale.dims();
                if n != dims[3] {
                    return Err(InterceptionError::EditLength {
                        layer,
                        what: "edit weights",
                        expected: dims[3],
                        actual: n,
                    });
                }
                Ok(weights * scale.clone().reshape([1, 1, 1, n]))
            }
            _ => Ok(weights),
        }
    }

    fn cached(&self, layer: AttentionLayerId) -> Result<Tensor<B, 4>, InterceptionError> {
        self.cached_map
            .clone()
            .ok_or(InterceptionError::MissingCachedMap {
                layer,
                mode: self.mode,
            })
    }

    fn edit(
        &self,
        layer: AttentionLayerId,
        weights: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, InterceptionError> {
        // Without an alignment there is nothing to blend
        let (mask, indices) = match (&self.edit_mask, &self.edit_indices) {
            (Some(mask), Some(indices)) => (mask.clone(), indices.clone()),
            _ => return Ok(weights),
        };

        let dims = weights.dims();
        let [n] = mask.dims();
        let [n_indices] = indices.dims();
        for (what, actual) in [("edit mask", n), ("edit indices", n_indices)] {
            if actual != dims[3] {
                return Err(InterceptionError::EditLength {
                    layer,
                    what,
                    expected: dims[3],
                    actual,
                });
            }
        }

        let cached = self.cached(layer)?;
        let gathered = cached.select(3, indices);
        check_numel(layer, &gathered.dims(), &dims)?;
        let gathered = gathered.reshape(dims);

        let mask = mask.reshape([1, 1, 1, n]);
        Ok(gathered * mask.clone() + weights * (mask.neg() + 1.0))
    }
}

fn check_numel(
    layer: AttentionLayerId,
    cached: &[usize],
    current: &[usize],
) -> Result<(), InterceptionError> {
    if cached.iter().product::<usize>() != current.iter().product::<usize>() {
        return Err(InterceptionError::ShapeMismatch {
            layer,
            cached: cached.to_vec(),
            current: current.to_vec(),
        });
    }
    Ok(())
}

/// Owned registry of interception state for every attention layer of a denoiser
///
/// Layers unknown to the registry fail the forward pass instead of silently
/// computing plain attention.
#[derive(Debug, Clone)]
pub struct AttentionControl<B: Backend> {
    states: BTreeMap<AttentionLayerId, InterceptionState<B>>,
}

impl<B: Backend> AttentionControl<B> {
    pub fn new(layers: impl IntoIterator<Item = AttentionLayerId>) -> Self {
        Self {
            states: layers
                .into_iter()
                .map(|id| (id, InterceptionState::default()))
                .collect(),
        }
    }

    pub fn layers(&self) -> impl Iterator<Item = AttentionLayerId> + '_ {
        self.states.keys().copied()
    }

    pub fn state(&self, layer: AttentionLayerId) -> Option<&InterceptionState<B>> {
        self.states.get(&layer)
    }

    fn states_of(
        &mut self,
        kind: Option<AttentionKind>,
    ) -> impl Iterator<Item = &mut InterceptionState<B>> + '_ {
        self.states
            .iter_mut()
            .filter(move |(id, _)| kind.map_or(true, |k| id.kind == k))
            .map(|(_, state)| state)
    }

    /// Set the mode of every layer of one kind
    pub fn set_mode(&mut self, kind: AttentionKind, mode: InterceptionMode) {
        tracing::trace!("{kind} layers -> {mode}");
        for state in self.states_of(Some(kind)) {
            state.mode = mode;
        }
    }

    pub fn set_mode_all(&mut self, mode: InterceptionMode) {
        tracing::trace!("all layers -> {mode}");
        for state in self.states_of(None) {
            state.mode = mode;
        }
    }

    pub fn set_use_weights(&mut self, kind: AttentionKind, use_weights: bool) {
        for state in self.states_of(Some(kind)) {
            state.use_weights = use_weights;
        }
    }

    pub fn clear_use_weights(&mut self) {
        for state in self.states_of(None) {
            state.use_weights = false;
        }
    }

    /// Token alignment consumed by `Edit` on cross-attention layers
    pub fn set_edit_alignment(&mut self, mask: Tensor<B, 1>, indices: Tensor<B, 1, Int>) {
        for state in self.states_of(Some(AttentionKind::CrossAttention)) {
            state.edit_mask = Some(mask.clone());
            state.edit_indices = Some(indices.clone());
        }
    }

    /// Per-token multipliers for cross-attention layers
    pub fn set_edit_weights(&mut self, weights: Tensor<B, 1>) {
        for state in self.states_of(Some(AttentionKind::CrossAttention)) {
            state.edit_weights = Some(weights.clone());
        }
    }

    /// Return every layer to the neutral baseline, dropping caches and edit data
    pub fn reset(&mut self) {
        for state in self.states_of(None) {
            state.reset();
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.states.values().all(InterceptionState::is_neutral)
    }
}

impl<B: Backend> InterceptionPolicy<B> for AttentionControl<B> {
    fn intercept(
        &mut self,
        layer: AttentionLayerId,
        weights: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, InterceptionError> {
        self.states
            .get_mut(&layer)
            .ok_or(InterceptionError::UnregisteredLayer(layer))?
            .apply(layer, weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::activation::softmax;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    const CROSS: AttentionLayerId = AttentionLayerId {
        block: 0,
        kind: AttentionKind::CrossAttention,
    };
    const SELF: AttentionLayerId = AttentionLayerId {
        block: 0,
        kind: AttentionKind::SelfAttention,
    };

    fn random_weights(seq: usize, keys: usize) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        let scores = Tensor::random([1, 2, seq, keys], Distribution::Normal(0.0, 1.0), &device);
        softmax(scores, 3)
    }

    fn to_vec(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("use_last".parse::<InterceptionMode>(), Ok(InterceptionMode::UseLast));
        assert_eq!("".parse::<InterceptionMode>(), Ok(InterceptionMode::None));
        assert_eq!(
            "uncond".parse::<InterceptionMode>(),
            Err(InterceptionError::UnknownMode("uncond".into()))
        );
        for mode in [
            InterceptionMode::Save,
            InterceptionMode::Edit,
            InterceptionMode::Injection,
            InterceptionMode::Unconditional,
        ] {
            assert_eq!(mode.as_str().parse::<InterceptionMode>(), Ok(mode));
        }
    }

    #[test]
    fn test_save_then_use_last_is_exact() {
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));
        let first = random_weights(4, 6);
        let second = random_weights(4, 6);

        control.set_mode_all(InterceptionMode::Save);
        let saved = control.intercept(CROSS, first.clone()).unwrap();
        assert_eq!(to_vec(saved), to_vec(first.clone()));

        control.set_mode_all(InterceptionMode::UseLast);
        let reused = control.intercept(CROSS, second).unwrap();
        assert_eq!(to_vec(reused), to_vec(first));
    }

    #[test]
    fn test_passthrough_modes_do_not_touch_weights() {
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));
        let weights = random_weights(3, 5);
        for mode in [
            InterceptionMode::None,
            InterceptionMode::Injection,
            InterceptionMode::Unconditional,
        ] {
            control.set_mode_all(mode);
            let out = control.intercept(SELF, weights.clone()).unwrap();
            assert_eq!(to_vec(out), to_vec(weights.clone()));
        }
        assert!(control.state(SELF).unwrap().cached_map.is_none());
    }

    #[test]
    fn test_use_last_without_cache_fails() {
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));
        control.set_mode(AttentionKind::SelfAttention, InterceptionMode::UseLast);
        assert!(matches!(
            control.intercept(SELF, random_weights(2, 2)),
            Err(InterceptionError::MissingCachedMap { .. })
        ));
    }

    #[test]
    fn test_unregistered_layer_fails() {
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));
        let stranger = AttentionLayerId::new(7, AttentionKind::CrossAttention);
        assert_eq!(
            control.intercept(stranger, random_weights(2, 2)).err(),
            Some(InterceptionError::UnregisteredLayer(stranger))
        );
    }

    #[test]
    fn test_edit_blends_gathered_columns() {
        let device = Default::default();
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));

        let cached = random_weights(2, 4);
        control.set_mode(AttentionKind::CrossAttention, InterceptionMode::Save);
        control.intercept(CROSS, cached.clone()).unwrap();

        // key 0 <- cached 0, key 1 inserted, key 2 <- cached 1, key 3 <- cached 3
        let mask = Tensor::from_data(TensorData::new(vec![1.0f32, 0.0, 1.0, 1.0], [4]), &device);
        let indices = Tensor::from_data(TensorData::new(vec![0i64, 0, 1, 3], [4]), &device);
        control.set_edit_alignment(mask, indices);
        control.set_mode(AttentionKind::CrossAttention, InterceptionMode::Edit);

        let current = random_weights(2, 4);
        let edited = to_vec(control.intercept(CROSS, current.clone()).unwrap());
        let cached = to_vec(cached);
        let current = to_vec(current);

        for row in 0..4 {
            let base = row * 4;
            assert_eq!(edited[base], cached[base]);
            assert_eq!(edited[base + 1], current[base + 1]);
            assert_eq!(edited[base + 2], cached[base + 1]);
            assert_eq!(edited[base + 3], cached[base + 3]);
        }
    }

    #[test]
    fn test_edit_without_alignment_passes_through() {
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));
        control.set_mode(AttentionKind::CrossAttention, InterceptionMode::Edit);
        let weights = random_weights(2, 3);
        let out = control.intercept(CROSS, weights.clone()).unwrap();
        assert_eq!(to_vec(out), to_vec(weights));
    }

    #[test]
    fn test_edit_weights_only_when_enabled() {
        let device = Default::default();
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));
        let scale = Tensor::from_data(TensorData::new(vec![2.0f32, 1.0, 0.0], [3]), &device);
        control.set_edit_weights(scale);

        let weights = random_weights(2, 3);
        let plain = control.intercept(CROSS, weights.clone()).unwrap();
        assert_eq!(to_vec(plain), to_vec(weights.clone()));

        control.set_use_weights(AttentionKind::CrossAttention, true);
        let scaled = to_vec(control.intercept(CROSS, weights.clone()).unwrap());
        let weights = to_vec(weights);
        for (i, (s, w)) in scaled.iter().zip(&weights).enumerate() {
            let factor = [2.0, 1.0, 0.0][i % 3];
            assert!((s - w * factor).abs() < 1e-7);
        }

        // self-attention layers never carry edit weights
        assert!(control.state(SELF).unwrap().edit_weights.is_none());
    }

    #[test]
    fn test_edit_weights_length_checked() {
        let device = Default::default();
        let mut control = AttentionControl::<TestBackend>::new(AttentionLayerId::pair(0));
        control.set_edit_weights(Tensor::ones([5], &device));
        control.set_use_weights(AttentionKind::CrossAttention, true);
        assert!(matches!(
            control.intercept(CROSS, random_weights(2, 3)),
            Err(InterceptionError::EditLength { expected: 3, actual: 5, .. })
        ));
    }

    #[test]
    fn test_reset_clears_everything() {
        let device = Default::default();
        let mut control = AttentionControl::<TestBackend>::new(
            AttentionLayerId::pair(0).into_iter().chain(AttentionLayerId::pair(1)),
        );
        control.set_mode_all(InterceptionMode::Save);
        control.intercept(CROSS, random_weights(2, 3)).unwrap();
        control.set_edit_weights(Tensor::ones([3], &device));
        control.set_use_weights(AttentionKind::CrossAttention, true);
        assert!(!control.is_neutral());

        control.reset();
        assert!(control.is_neutral());
        assert_eq!(control.layers().count(), 4);
    }
}
