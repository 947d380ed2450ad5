//! Per-tensor transformation pipelines.
//!
//! A [`Pipeline`] is an ordered sequence of [`PipelineStep`]s applied to one
//! tensor's payload before serialization (left-to-right) and undone after
//! deserialization (right-to-left). Steps are stateless and pure given
//! their [`StepMeta`]: no step may look at any tensor other than the one
//! being processed, which keeps tensors independently processable.
//!
//! The payload convention is big-endian `f32` bytes at every step boundary,
//! with one exception: [`Quantize`] re-encodes the payload as bucket
//! indices and must therefore be the final step of a pipeline, which
//! [`Pipeline::new`] enforces.

mod quantize;
mod sparsify;

pub use self::{quantize::Quantize, sparsify::Sparsify};

use std::convert::TryInto;

use thiserror::Error;

use crate::record::{DecodeError, ToBytes};

/// Step identifier of [`PipelineStep::NoCompression`] in a weight record.
pub const NO_COMPRESSION_ID: u8 = 0;
/// Step identifier of [`PipelineStep::Quantize`] in a weight record.
pub const QUANTIZE_ID: u8 = 1;
/// Step identifier of [`PipelineStep::Sparsify`] in a weight record.
pub const SPARSIFY_ID: u8 = 2;

#[derive(Debug, Error, PartialEq)]
/// Errors related to pipeline construction and execution.
pub enum PipelineError {
    #[error("payload of {0} bytes is not a whole number of 32-bit values")]
    Alignment(usize),
    #[error("quantization requires at least two levels, got {0}")]
    InvalidLevels(u16),
    #[error("sparsification threshold must be positive and finite, got {0}")]
    InvalidThreshold(f32),
    #[error("{0} must be the final pipeline step")]
    NotFinal(&'static str),
    #[error("metadata does not match step {0}")]
    MetaMismatch(&'static str),
    #[error("expected {expected} metadata entries, got {actual}")]
    MetaCount { expected: usize, actual: usize },
    #[error("sparse index {index} is out of bounds for {total} elements")]
    IndexOutOfBounds { index: u32, total: u32 },
    #[error("sparse payload has {values} values but the metadata lists {indices} indices")]
    SparseCount { values: usize, indices: usize },
}

/// One reversible transform of a transformation pipeline.
///
/// A closed set of step kinds: adding a kind means adding a variant here,
/// the codec does not need to change.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStep {
    /// The identity transform.
    NoCompression,
    /// Affine min/max quantization to a fixed number of levels. Lossy.
    Quantize(Quantize),
    /// Drops elements whose magnitude is below a threshold. Lossy.
    Sparsify(Sparsify),
}

impl PipelineStep {
    /// Gets the step identifier written to weight records.
    pub fn id(&self) -> u8 {
        match self {
            PipelineStep::NoCompression => NO_COMPRESSION_ID,
            PipelineStep::Quantize(_) => QUANTIZE_ID,
            PipelineStep::Sparsify(_) => SPARSIFY_ID,
        }
    }

    /// Checks whether this step reproduces its input bit-exactly.
    pub fn is_lossless(&self) -> bool {
        matches!(self, PipelineStep::NoCompression)
    }

    /// Checks whether this step changes the payload representation away
    /// from `f32` bytes, in which case no step may follow it.
    fn changes_representation(&self) -> bool {
        matches!(self, PipelineStep::Quantize(_))
    }

    /// Gets the declared worst-case absolute reconstruction error for the
    /// given tensor values. Zero for lossless steps.
    pub fn error_bound(&self, data: &[f32]) -> f32 {
        match self {
            PipelineStep::NoCompression => 0.0,
            PipelineStep::Quantize(quantize) => quantize.error_bound(data),
            PipelineStep::Sparsify(sparsify) => sparsify.error_bound(),
        }
    }

    /// Applies the forward transform to `payload`.
    pub fn compress(&self, payload: &[u8]) -> Result<(Vec<u8>, StepMeta), PipelineError> {
        match self {
            PipelineStep::NoCompression => Ok((payload.to_vec(), StepMeta::None)),
            PipelineStep::Quantize(quantize) => quantize.compress(payload),
            PipelineStep::Sparsify(sparsify) => sparsify.compress(payload),
        }
    }

    /// Applies the inverse transform to `payload` using the metadata the
    /// forward transform produced.
    pub fn decompress(&self, payload: &[u8], meta: &StepMeta) -> Result<Vec<u8>, PipelineError> {
        match (self, meta) {
            (PipelineStep::NoCompression, StepMeta::None) => Ok(payload.to_vec()),
            (PipelineStep::Quantize(quantize), StepMeta::Quantize { min, max }) => {
                quantize.decompress(payload, *min, *max)
            }
            (PipelineStep::Sparsify(sparsify), StepMeta::Sparsify { indices, total }) => {
                sparsify.decompress(payload, indices, *total)
            }
            (step, _) => Err(PipelineError::MetaMismatch(step.name())),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PipelineStep::NoCompression => "no_compression",
            PipelineStep::Quantize(_) => "quantize",
            PipelineStep::Sparsify(_) => "sparsify",
        }
    }
}

/// Per-step reconstruction metadata carried alongside the payload in a
/// weight record.
#[derive(Debug, Clone, PartialEq)]
pub enum StepMeta {
    /// No metadata.
    None,
    /// The value range of the quantized tensor.
    Quantize { min: f32, max: f32 },
    /// The positions of the kept elements and the original element count.
    Sparsify { indices: Vec<u32>, total: u32 },
}

impl ToBytes for StepMeta {
    fn buffer_length(&self) -> usize {
        match self {
            StepMeta::None => 0,
            StepMeta::Quantize { .. } => 8,
            StepMeta::Sparsify { indices, .. } => 4 + 4 * indices.len(),
        }
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let buffer = buffer.as_mut();
        match self {
            StepMeta::None => {}
            StepMeta::Quantize { min, max } => {
                buffer[0..4].copy_from_slice(&min.to_be_bytes());
                buffer[4..8].copy_from_slice(&max.to_be_bytes());
            }
            StepMeta::Sparsify { indices, total } => {
                buffer[0..4].copy_from_slice(&total.to_be_bytes());
                for (i, index) in indices.iter().enumerate() {
                    let offset = 4 + 4 * i;
                    buffer[offset..offset + 4].copy_from_slice(&index.to_be_bytes());
                }
            }
        }
    }
}

impl StepMeta {
    /// Deserializes the metadata blob of the step identified by `step_id`.
    pub fn from_bytes(step_id: u8, bytes: &[u8]) -> Result<Self, DecodeError> {
        use anyhow::anyhow;
        match step_id {
            NO_COMPRESSION_ID => {
                if !bytes.is_empty() {
                    return Err(anyhow!("unexpected metadata for the no-compression step"));
                }
                Ok(StepMeta::None)
            }
            QUANTIZE_ID => {
                if bytes.len() != 8 {
                    return Err(anyhow!(
                        "quantization metadata must be 8 bytes, got {}",
                        bytes.len()
                    ));
                }
                let min = f32::from_be_bytes(bytes[0..4].try_into().unwrap());
                let max = f32::from_be_bytes(bytes[4..8].try_into().unwrap());
                Ok(StepMeta::Quantize { min, max })
            }
            SPARSIFY_ID => {
                if bytes.len() < 4 || (bytes.len() - 4) % 4 != 0 {
                    return Err(anyhow!(
                        "sparsification metadata has invalid length {}",
                        bytes.len()
                    ));
                }
                let total = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
                let indices = bytes[4..]
                    .chunks(4)
                    .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()))
                    .collect();
                Ok(StepMeta::Sparsify { indices, total })
            }
            id => Err(anyhow!("unknown pipeline step identifier {}", id)),
        }
    }
}

/// An ordered sequence of pipeline steps. The empty pipeline is the
/// identity and the default when a plan specifies no compression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline(Vec<PipelineStep>);

impl Pipeline {
    /// Creates the identity pipeline.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Creates a pipeline, rejecting step orders in which a
    /// representation-changing step is followed by another step.
    pub fn new(steps: Vec<PipelineStep>) -> Result<Self, PipelineError> {
        for (i, step) in steps.iter().enumerate() {
            if step.changes_representation() && i + 1 != steps.len() {
                return Err(PipelineError::NotFinal(step.name()));
            }
        }
        Ok(Self(steps))
    }

    /// Gets the steps of this pipeline.
    pub fn steps(&self) -> &[PipelineStep] {
        &self.0
    }

    /// Gets the step identifiers in application order.
    pub fn step_ids(&self) -> Vec<u8> {
        self.0.iter().map(PipelineStep::id).collect()
    }

    /// Checks whether every step of this pipeline is lossless.
    pub fn is_lossless(&self) -> bool {
        self.0.iter().all(PipelineStep::is_lossless)
    }

    /// Gets the declared worst-case absolute reconstruction error for the
    /// given tensor values: the sum of the steps' bounds.
    pub fn error_bound(&self, data: &[f32]) -> f32 {
        self.0.iter().map(|step| step.error_bound(data)).sum()
    }

    /// Compresses one tensor's values, composing the steps left-to-right.
    pub fn compress(&self, data: &[f32]) -> Result<(Vec<u8>, Vec<StepMeta>), PipelineError> {
        let mut payload = floats_to_bytes(data);
        let mut metas = Vec::with_capacity(self.0.len());
        for step in &self.0 {
            let (next, meta) = step.compress(&payload)?;
            payload = next;
            metas.push(meta);
        }
        Ok((payload, metas))
    }

    /// Decompresses one tensor's payload, composing the steps
    /// right-to-left. `metas` must hold one entry per step, in
    /// application order.
    pub fn decompress(&self, payload: &[u8], metas: &[StepMeta]) -> Result<Vec<f32>, PipelineError> {
        if metas.len() != self.0.len() {
            return Err(PipelineError::MetaCount {
                expected: self.0.len(),
                actual: metas.len(),
            });
        }
        let mut payload = payload.to_vec();
        for (step, meta) in self.0.iter().zip(metas.iter()).rev() {
            payload = step.decompress(&payload, meta)?;
        }
        bytes_to_floats(&payload)
    }
}

pub(crate) fn floats_to_bytes(data: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 * data.len());
    for value in data {
        bytes.extend_from_slice(&value.to_be_bytes());
    }
    bytes
}

pub(crate) fn bytes_to_floats(bytes: &[u8]) -> Result<Vec<f32>, PipelineError> {
    if bytes.len() % 4 != 0 {
        return Err(PipelineError::Alignment(bytes.len()));
    }
    Ok(bytes
        .chunks(4)
        .map(|chunk| f32::from_be_bytes(chunk.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_pipeline_is_exact() {
        let data = vec![-1.5, 0.0, 3.25, f32::MIN_POSITIVE];
        let pipeline = Pipeline::identity();
        assert!(pipeline.is_lossless());

        let (payload, metas) = pipeline.compress(&data).unwrap();
        assert!(metas.is_empty());
        assert_eq!(pipeline.decompress(&payload, &metas).unwrap(), data);
    }

    #[test]
    fn test_no_compression_step_is_exact() {
        let data = vec![1.0, -2.0, 0.5];
        let pipeline = Pipeline::new(vec![PipelineStep::NoCompression]).unwrap();
        assert!(pipeline.is_lossless());

        let (payload, metas) = pipeline.compress(&data).unwrap();
        assert_eq!(metas, vec![StepMeta::None]);
        assert_eq!(pipeline.decompress(&payload, &metas).unwrap(), data);
    }

    #[test]
    fn test_lossy_pipeline_respects_declared_bound() {
        let data: Vec<f32> = (0..100).map(|i| (i as f32) * 0.1 - 5.0).collect();
        let pipeline = Pipeline::new(vec![
            PipelineStep::Sparsify(Sparsify::new(0.05).unwrap()),
            PipelineStep::Quantize(Quantize::new(256).unwrap()),
        ])
        .unwrap();
        assert!(!pipeline.is_lossless());

        let (payload, metas) = pipeline.compress(&data).unwrap();
        let restored = pipeline.decompress(&payload, &metas).unwrap();
        let bound = pipeline.error_bound(&data);
        assert_eq!(restored.len(), data.len());
        for (original, roundtripped) in data.iter().zip(restored.iter()) {
            assert!(
                (original - roundtripped).abs() <= bound,
                "error {} exceeds bound {}",
                (original - roundtripped).abs(),
                bound
            );
        }
    }

    #[test]
    fn test_quantize_must_be_final() {
        let steps = vec![
            PipelineStep::Quantize(Quantize::new(16).unwrap()),
            PipelineStep::NoCompression,
        ];
        assert_eq!(
            Pipeline::new(steps).unwrap_err(),
            PipelineError::NotFinal("quantize")
        );
    }

    #[test]
    fn test_meta_count_is_checked() {
        let pipeline = Pipeline::new(vec![PipelineStep::NoCompression]).unwrap();
        let err = pipeline.decompress(&[], &[]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::MetaCount {
                expected: 1,
                actual: 0
            }
        );
    }

    #[test]
    fn test_meta_serialization_roundtrip() {
        let metas = vec![
            (NO_COMPRESSION_ID, StepMeta::None),
            (
                QUANTIZE_ID,
                StepMeta::Quantize {
                    min: -1.25,
                    max: 7.5,
                },
            ),
            (
                SPARSIFY_ID,
                StepMeta::Sparsify {
                    indices: vec![0, 3, 17],
                    total: 32,
                },
            ),
        ];
        for (id, meta) in metas {
            let mut bytes = vec![0; meta.buffer_length()];
            meta.to_bytes(&mut bytes);
            assert_eq!(StepMeta::from_bytes(id, &bytes).unwrap(), meta);
        }
        assert!(StepMeta::from_bytes(99, &[]).is_err());
    }
}
