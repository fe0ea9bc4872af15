//! Classifier-Free Guidance

use burn::prelude::*;

/// Apply classifier-free guidance
///
/// Combines conditional and unconditional predictions:
/// `output = uncond + guidance_scale * (cond - uncond)`
pub fn apply_guidance<B: Backend>(
    noise_pred_uncond: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    guidance_scale: f64,
) -> Tensor<B, 4> {
    noise_pred_uncond.clone() + (noise_pred_cond - noise_pred_uncond) * guidance_scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_guidance_extrapolates_from_uncond() {
        let device = Default::default();
        let uncond = Tensor::<TestBackend, 4>::full([1, 4, 2, 2], 1.0, &device);
        let cond = Tensor::<TestBackend, 4>::full([1, 4, 2, 2], 2.0, &device);

        let guided = apply_guidance(uncond, cond, 7.5);
        let values: Vec<f32> = guided.into_data().to_vec().unwrap();
        assert!(values.iter().all(|&v| (v - 8.5).abs() < 1e-6));
    }

    #[test]
    fn test_unit_scale_returns_cond() {
        let device = Default::default();
        let uncond = Tensor::<TestBackend, 4>::full([1, 4, 2, 2], -3.0, &device);
        let cond = Tensor::<TestBackend, 4>::full([1, 4, 2, 2], 0.25, &device);

        let guided = apply_guidance(uncond, cond.clone(), 1.0);
        let diff: f32 = (guided - cond).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }
}
