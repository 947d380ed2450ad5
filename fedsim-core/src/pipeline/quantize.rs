use std::convert::TryInto;

use super::{bytes_to_floats, PipelineError, StepMeta};

/// Affine min/max quantization to a fixed number of levels.
///
/// Each value is mapped to the nearest of `levels` evenly spaced points
/// between the tensor's minimum and maximum and stored as a 16-bit bucket
/// index. The payload is no longer `f32` bytes afterwards, so this step
/// only composes as the final step of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantize {
    levels: u16,
}

impl Quantize {
    /// Creates a quantization step with the given number of levels.
    ///
    /// Fails with [`PipelineError::InvalidLevels`] for fewer than two
    /// levels, which could not represent distinct values.
    pub fn new(levels: u16) -> Result<Self, PipelineError> {
        if levels < 2 {
            return Err(PipelineError::InvalidLevels(levels));
        }
        Ok(Self { levels })
    }

    /// Gets the number of quantization levels.
    pub fn levels(&self) -> u16 {
        self.levels
    }

    /// Gets the worst-case absolute error for values in the range of
    /// `data`: half the spacing between adjacent levels.
    pub fn error_bound(&self, data: &[f32]) -> f32 {
        match value_range(data) {
            Some((min, max)) => (max - min) / (2.0 * (self.levels - 1) as f32),
            None => 0.0,
        }
    }

    pub(super) fn compress(&self, payload: &[u8]) -> Result<(Vec<u8>, StepMeta), PipelineError> {
        let values = bytes_to_floats(payload)?;
        let (min, max) = value_range(&values).unwrap_or((0.0, 0.0));
        let scale = if max > min {
            (self.levels - 1) as f32 / (max - min)
        } else {
            0.0
        };
        let top = (self.levels - 1) as f32;
        let mut quantized = Vec::with_capacity(2 * values.len());
        for value in values {
            let index = num::clamp(((value - min) * scale).round(), 0.0, top) as u16;
            quantized.extend_from_slice(&index.to_be_bytes());
        }
        Ok((quantized, StepMeta::Quantize { min, max }))
    }

    pub(super) fn decompress(
        &self,
        payload: &[u8],
        min: f32,
        max: f32,
    ) -> Result<Vec<u8>, PipelineError> {
        if payload.len() % 2 != 0 {
            return Err(PipelineError::Alignment(payload.len()));
        }
        let spacing = if max > min {
            (max - min) / (self.levels - 1) as f32
        } else {
            0.0
        };
        let mut restored = Vec::with_capacity(2 * payload.len());
        for chunk in payload.chunks(2) {
            let index = u16::from_be_bytes(chunk.try_into().unwrap());
            let value = min + index as f32 * spacing;
            restored.extend_from_slice(&value.to_be_bytes());
        }
        Ok(restored)
    }
}

fn value_range(data: &[f32]) -> Option<(f32, f32)> {
    let mut iter = data.iter().copied();
    let first = iter.next()?;
    let mut min = first;
    let mut max = first;
    for value in iter {
        min = min.min(value);
        max = max.max(value);
    }
    Some((min, max))
}
