use super::{bytes_to_floats, floats_to_bytes, PipelineError, StepMeta};

/// Magnitude sparsification: drops every element whose absolute value is
/// below a threshold and records the positions of the kept elements.
///
/// Dropped elements are restored as zero, so the absolute reconstruction
/// error of any element is below the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Sparsify {
    threshold: f32,
}

impl Sparsify {
    /// Creates a sparsification step with the given magnitude threshold.
    ///
    /// Fails with [`PipelineError::InvalidThreshold`] unless the threshold
    /// is positive and finite.
    pub fn new(threshold: f32) -> Result<Self, PipelineError> {
        if !(threshold > 0.0 && threshold.is_finite()) {
            return Err(PipelineError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    /// Gets the magnitude threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Gets the worst-case absolute error: the threshold itself, since
    /// only elements smaller than it are zeroed.
    pub fn error_bound(&self) -> f32 {
        self.threshold
    }

    pub(super) fn compress(&self, payload: &[u8]) -> Result<(Vec<u8>, StepMeta), PipelineError> {
        let values = bytes_to_floats(payload)?;
        let total = values.len() as u32;
        let mut kept = Vec::new();
        let mut indices = Vec::new();
        for (i, value) in values.into_iter().enumerate() {
            if value.abs() >= self.threshold {
                kept.push(value);
                indices.push(i as u32);
            }
        }
        Ok((floats_to_bytes(&kept), StepMeta::Sparsify { indices, total }))
    }

    pub(super) fn decompress(
        &self,
        payload: &[u8],
        indices: &[u32],
        total: u32,
    ) -> Result<Vec<u8>, PipelineError> {
        let kept = bytes_to_floats(payload)?;
        if kept.len() != indices.len() {
            return Err(PipelineError::SparseCount {
                values: kept.len(),
                indices: indices.len(),
            });
        }
        // the metadata is untrusted, so the indices are validated before
        // `total` drives an allocation
        if let Some(index) = indices.iter().copied().find(|index| *index >= total) {
            return Err(PipelineError::IndexOutOfBounds { index, total });
        }
        let mut restored = vec![0.0_f32; total as usize];
        for (index, value) in indices.iter().zip(kept.into_iter()) {
            restored[*index as usize] = value;
        }
        Ok(floats_to_bytes(&restored))
    }
}
