//! Tensor statistics and NaN/Inf checks

use burn::prelude::*;

use crate::error::PipelineError;

/// Copy a tensor to the host as f32
pub(crate) fn tensor_values<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
) -> Result<Vec<f32>, PipelineError> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| PipelineError::TensorData(format!("{e:?}")))
}

/// Summary statistics for debug logging
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let floats = match tensor_values(tensor) {
        Ok(floats) => floats,
        Err(e) => return e.to_string(),
    };
    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = floats.iter().sum::<f32>() / floats.len() as f32;
    let var = floats.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / floats.len() as f32;

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4} [NaN={}, Inf={}]",
            min,
            max,
            mean,
            var.sqrt(),
            nan_count,
            inf_count
        )
    } else {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            min,
            max,
            mean,
            var.sqrt()
        )
    }
}

/// Fail with [`PipelineError::NonFinite`] if `enabled` and the tensor holds NaN or Inf
pub fn check_tensor<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
    enabled: bool,
) -> Result<(), PipelineError> {
    if !enabled {
        return Ok(());
    }

    let floats = tensor_values(tensor)?;
    if floats.iter().any(|x| !x.is_finite()) {
        return Err(PipelineError::NonFinite {
            name: name.to_string(),
            stats: tensor_stats(tensor),
        });
    }
    Ok(())
}
