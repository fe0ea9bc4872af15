//! Decoded image batches

use std::path::Path;

use burn::prelude::*;
use image::RgbImage;

use crate::diagnostics::tensor_values;
use crate::error::{PipelineError, UsageError};

/// RGB images as `u8`, batch-major NHWC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBatch {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    /// `batch * height * width * 3` bytes
    pub data: Vec<u8>,
}

impl ImageBatch {
    /// Convert decoder output `[batch, 3, H, W]` in [-1, 1]
    ///
    /// Values are mapped to `(x + 1) / 2 * 255`, clamped and truncated.
    pub fn from_decoded<B: Backend>(decoded: Tensor<B, 4>) -> Result<Self, PipelineError> {
        let [batch, channels, height, width] = decoded.dims();
        if channels != 3 {
            return Err(UsageError::ShapeMismatch {
                what: "decoded image",
                expected: vec![batch, 3, height, width],
                actual: vec![batch, channels, height, width],
            }
            .into());
        }

        let pixels = ((decoded + 1.0) / 2.0 * 255.0).clamp(0.0, 255.0);
        let floats = tensor_values(&pixels)?;

        let plane = height * width;
        let mut data = Vec::with_capacity(batch * plane * 3);
        for b in 0..batch {
            let image = &floats[b * 3 * plane..(b + 1) * 3 * plane];
            for p in 0..plane {
                for c in 0..3 {
                    data.push(image[c * plane + p] as u8);
                }
            }
        }

        Ok(Self {
            batch,
            height,
            width,
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.batch
    }

    pub fn is_empty(&self) -> bool {
        self.batch == 0
    }

    /// Raw bytes of image `index`, or `None` if out of range
    pub fn image(&self, index: usize) -> Option<&[u8]> {
        let size = self.height * self.width * 3;
        self.data.get(index * size..(index + 1) * size)
    }

    pub fn to_rgb_image(&self, index: usize) -> Option<RgbImage> {
        let bytes = self.image(index)?;
        RgbImage::from_raw(self.width as u32, self.height as u32, bytes.to_vec())
    }

    pub fn to_rgb_images(&self) -> Vec<RgbImage> {
        (0..self.batch)
            .filter_map(|i| self.to_rgb_image(i))
            .collect()
    }

    /// Write image `index` as PNG
    pub fn save_png(&self, path: impl AsRef<Path>, index: usize) -> Result<(), PipelineError> {
        let image = self.to_rgb_image(index).ok_or_else(|| {
            PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no image {index} in a batch of {}", self.batch),
            ))
        })?;
        image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    /// Back to a `[batch, 3, H, W]` tensor with values in [0, 255]
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let values: Vec<f32> = self.data.iter().map(|&v| f32::from(v)).collect();
        Tensor::<B, 4>::from_data(
            TensorData::new(values, [self.batch, self.height, self.width, 3]),
            device,
        )
        .permute([0, 3, 1, 2])
    }
}
