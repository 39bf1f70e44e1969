// Affine quantization parameters attached to integer tensors
//
//   real_value = scale * (quantized_value - zero_point)
//
// Per-tensor parameters carry one scale/zero-point pair. Per-channel
// parameters carry one pair per slice along `quantized_dimension` (usually
// the output-channel axis of a weight tensor).

use crate::error::{Error, Result};
use crate::shape::Shape;

/// Scale / zero-point parameters of an affine-quantized tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineQuantization {
    scale: Vec<f32>,
    zero_point: Vec<i32>,
    quantized_dimension: usize,
}

impl AffineQuantization {
    /// One scale and zero-point for the whole tensor.
    pub fn per_tensor(scale: f32, zero_point: i32) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![zero_point],
            quantized_dimension: 0,
        }
    }

    /// One scale and zero-point per slice along `quantized_dimension`.
    pub fn per_channel(
        scale: Vec<f32>,
        zero_point: Vec<i32>,
        quantized_dimension: usize,
    ) -> Result<Self> {
        if scale.len() != zero_point.len() {
            return Err(Error::msg(format!(
                "per-channel quantization has {} scales but {} zero points",
                scale.len(),
                zero_point.len()
            )));
        }
        Ok(Self {
            scale,
            zero_point,
            quantized_dimension,
        })
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    pub fn zero_point(&self) -> &[i32] {
        &self.zero_point
    }

    pub fn quantized_dimension(&self) -> usize {
        self.quantized_dimension
    }

    pub fn is_per_channel(&self) -> bool {
        self.scale.len() > 1
    }

    /// Check that the parameter count matches the tensor it is attached to.
    pub fn validate(&self, shape: &Shape) -> Result<()> {
        if !self.is_per_channel() {
            return Ok(());
        }
        let channels = shape.dim(self.quantized_dimension)?;
        if channels != self.scale.len() {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(channels),
                got: Shape::from(self.scale.len()),
            });
        }
        Ok(())
    }

    /// Real value of a quantized element belonging to `channel`.
    pub fn dequantize(&self, value: i32, channel: usize) -> f32 {
        let c = if self.is_per_channel() { channel } else { 0 };
        self.scale[c] * (value - self.zero_point[c]) as f32
    }
}
