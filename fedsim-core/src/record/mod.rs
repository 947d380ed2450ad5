//! The weight record codec.
//!
//! A weight record is the portable binary form of a shared tensor
//! dictionary: the blob broadcast to collaborators at the start of a round,
//! sent back after local training, and written to checkpoint files. The
//! format is self-describing with respect to reconstruction metadata, but
//! decoding still requires the federation plan's [`Pipeline`], whose step
//! sequence must match the one recorded per tensor.
//!
//! ## Wire format
//!
//! All integers are big-endian.
//!
//! ```text
//! magic "FWR1" | version u8 | tensor count u32
//! per tensor:
//!     name length u16 | name (UTF-8)
//!     rank u8 | dimension u32 per axis
//!     step count u8
//!     per step: step id u8 | metadata length u32 | metadata
//!     payload length u32
//! concatenated payloads, in tensor order
//! ```

mod traits;

pub use self::traits::{DecodeError, ToBytes};
pub(crate) use self::traits::Reader;

use std::convert::TryFrom;

use anyhow::{anyhow, Context};
use thiserror::Error;

use crate::{
    pipeline::{Pipeline, PipelineError, StepMeta},
    tensor::{Tensor, TensorDict},
};

/// The four magic bytes every weight record starts with.
pub const MAGIC: [u8; 4] = *b"FWR1";
/// The format version this codec reads and writes.
pub const VERSION: u8 = 1;

#[derive(Debug, Error)]
/// Errors related to encoding and decoding weight records.
pub enum CodecError {
    #[error("malformed weight record: {0}")]
    Format(String),
    #[error(
        "tensor {name} was encoded with pipeline steps {recorded:?} but the plan declares {provided:?}"
    )]
    PipelineMismatch {
        name: String,
        recorded: Vec<u8>,
        provided: Vec<u8>,
    },
    #[error("tensor {name} with shape {shape:?} requires {expected} values but decoded {actual}")]
    Shape {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("pipeline failed on tensor {name}")]
    Pipeline {
        name: String,
        #[source]
        source: PipelineError,
    },
    #[error("tensor {0} appears more than once in the record")]
    DuplicateName(String),
    #[error("value does not fit the wire format: {0}")]
    Overflow(String),
}

impl CodecError {
    fn format(err: DecodeError) -> Self {
        CodecError::Format(format!("{:#}", err))
    }
}

/// A structurally validated weight record.
///
/// Construction via [`from_bytes`][WeightRecord::from_bytes] guarantees
/// that the header parses and that every declared payload is present, so a
/// stored `WeightRecord` can always be re-parsed. It does not guarantee
/// that the record decodes under any particular pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightRecord {
    bytes: Vec<u8>,
}

impl WeightRecord {
    /// Validates `bytes` as a weight record.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CodecError> {
        let entries = parse_entries(&bytes).map_err(CodecError::format)?;
        let mut seen: Vec<&str> = Vec::with_capacity(entries.len());
        for entry in &entries {
            if seen.contains(&entry.name.as_str()) {
                return Err(CodecError::DuplicateName(entry.name.clone()));
            }
            seen.push(&entry.name);
        }
        Ok(Self { bytes })
    }

    /// Gets the serialized record.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the record and returns the serialized bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Gets the number of serialized bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Checks whether the record is empty. Always false: even a record of
    /// zero tensors carries the header.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encodes a tensor dictionary into a weight record, passing every tensor
/// through `pipeline`.
pub fn encode(dict: &TensorDict, pipeline: &Pipeline) -> Result<WeightRecord, CodecError> {
    let mut header = Vec::new();
    header.extend_from_slice(&MAGIC);
    header.push(VERSION);
    let count = u32::try_from(dict.len())
        .map_err(|_| CodecError::Overflow(format!("{} tensors", dict.len())))?;
    header.extend_from_slice(&count.to_be_bytes());

    let mut payloads = Vec::new();
    for (name, tensor) in dict.iter() {
        let (payload, metas) =
            pipeline
                .compress(tensor.data())
                .map_err(|source| CodecError::Pipeline {
                    name: name.clone(),
                    source,
                })?;
        write_entry(&mut header, name, tensor.shape(), pipeline, &metas, &payload)?;
        payloads.extend_from_slice(&payload);
    }

    header.extend_from_slice(&payloads);
    // round-trips by construction
    Ok(WeightRecord { bytes: header })
}

/// Decodes a weight record back into a tensor dictionary.
///
/// All-or-nothing: any per-tensor failure rejects the whole record.
pub fn decode(record: &WeightRecord, pipeline: &Pipeline) -> Result<TensorDict, CodecError> {
    let entries = parse_entries(record.as_slice()).map_err(CodecError::format)?;
    let provided = pipeline.step_ids();
    let mut dict = TensorDict::new();
    for entry in entries {
        let Entry {
            name,
            shape,
            steps,
            payload,
        } = entry;
        if dict.contains(&name) {
            return Err(CodecError::DuplicateName(name));
        }
        let recorded: Vec<u8> = steps.iter().map(|(id, _)| *id).collect();
        if recorded != provided {
            return Err(CodecError::PipelineMismatch {
                name,
                recorded,
                provided,
            });
        }
        // the shape dimensions are untrusted input, so the element count is
        // computed with overflow checks and validated against the sparse
        // metadata before anything is allocated from it
        let expected = shape
            .iter()
            .try_fold(1usize, |count, dim| count.checked_mul(*dim))
            .ok_or_else(|| {
                CodecError::Format(format!("tensor {}: shape {:?} overflows", name, shape))
            })?;
        let metas: Vec<StepMeta> = steps.into_iter().map(|(_, meta)| meta).collect();
        for meta in &metas {
            if let StepMeta::Sparsify { total, .. } = meta {
                if *total as usize != expected {
                    return Err(CodecError::Format(format!(
                        "tensor {}: sparse metadata declares {} elements but the shape holds {}",
                        name, total, expected
                    )));
                }
            }
        }
        let values = pipeline
            .decompress(payload, &metas)
            .map_err(|source| CodecError::Pipeline {
                name: name.clone(),
                source,
            })?;
        if expected != values.len() {
            return Err(CodecError::Shape {
                name,
                shape,
                expected,
                actual: values.len(),
            });
        }
        let tensor = Tensor::new(shape, values)
            .map_err(|err| CodecError::Format(format!("tensor {}: {}", name, err)))?;
        dict.insert(name, tensor);
    }
    Ok(dict)
}

struct Entry<'a> {
    name: String,
    shape: Vec<usize>,
    steps: Vec<(u8, StepMeta)>,
    payload: &'a [u8],
}

fn write_entry(
    buffer: &mut Vec<u8>,
    name: &str,
    shape: &[usize],
    pipeline: &Pipeline,
    metas: &[StepMeta],
    payload: &[u8],
) -> Result<(), CodecError> {
    let overflow = |what: String| CodecError::Overflow(what);

    let name_len = u16::try_from(name.len())
        .map_err(|_| overflow(format!("name of {} bytes", name.len())))?;
    buffer.extend_from_slice(&name_len.to_be_bytes());
    buffer.extend_from_slice(name.as_bytes());

    let rank = u8::try_from(shape.len())
        .map_err(|_| overflow(format!("tensor {} of rank {}", name, shape.len())))?;
    buffer.push(rank);
    for dim in shape {
        let dim = u32::try_from(*dim)
            .map_err(|_| overflow(format!("tensor {} dimension {}", name, dim)))?;
        buffer.extend_from_slice(&dim.to_be_bytes());
    }

    let steps = pipeline.steps();
    buffer.push(steps.len() as u8);
    for (step, meta) in steps.iter().zip(metas.iter()) {
        buffer.push(step.id());
        let meta_len = u32::try_from(meta.buffer_length())
            .map_err(|_| overflow(format!("metadata of {} bytes", meta.buffer_length())))?;
        buffer.extend_from_slice(&meta_len.to_be_bytes());
        let start = buffer.len();
        buffer.resize(start + meta.buffer_length(), 0);
        meta.to_bytes(&mut &mut buffer[start..]);
    }

    let payload_len = u32::try_from(payload.len())
        .map_err(|_| overflow(format!("payload of {} bytes", payload.len())))?;
    buffer.extend_from_slice(&payload_len.to_be_bytes());
    Ok(())
}

fn parse_entries(bytes: &[u8]) -> Result<Vec<Entry>, DecodeError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.take(4).context("reading magic bytes")?;
    if magic != MAGIC {
        return Err(anyhow!("invalid magic bytes {:?}", magic));
    }
    let version = reader.read_u8().context("reading version")?;
    if version != VERSION {
        return Err(anyhow!("unsupported record version {}", version));
    }
    let count = reader.read_u32().context("reading tensor count")?;
    // a tensor entry takes at least the name length, rank, step count and
    // payload length fields, so a count beyond this bound cannot be honest
    // and must not drive an allocation
    const ENTRY_MIN_LEN: usize = 8;
    if count as usize > reader.remaining() / ENTRY_MIN_LEN {
        return Err(anyhow!(
            "tensor count {} exceeds the {} remaining bytes",
            count,
            reader.remaining()
        ));
    }

    struct Header {
        name: String,
        shape: Vec<usize>,
        steps: Vec<(u8, StepMeta)>,
        payload_len: usize,
    }

    let mut headers = Vec::with_capacity(count as usize);
    for i in 0..count {
        let context = |what: &str| format!("tensor {}: reading {}", i, what);

        let name_len = reader.read_u16().with_context(|| context("name length"))?;
        let name = std::str::from_utf8(reader.take(name_len as usize).with_context(|| context("name"))?)
            .with_context(|| context("name"))?
            .to_string();

        let rank = reader.read_u8().with_context(|| context("rank"))?;
        let mut shape = Vec::with_capacity(rank as usize);
        for _ in 0..rank {
            shape.push(reader.read_u32().with_context(|| context("dimension"))? as usize);
        }

        let step_count = reader.read_u8().with_context(|| context("step count"))?;
        let mut steps = Vec::with_capacity(step_count as usize);
        for _ in 0..step_count {
            let id = reader.read_u8().with_context(|| context("step id"))?;
            let meta_len = reader
                .read_u32()
                .with_context(|| context("metadata length"))?;
            let meta_bytes = reader
                .take(meta_len as usize)
                .with_context(|| context("metadata"))?;
            let meta = StepMeta::from_bytes(id, meta_bytes)
                .with_context(|| format!("tensor {} ({})", i, name))?;
            steps.push((id, meta));
        }

        let payload_len = reader
            .read_u32()
            .with_context(|| context("payload length"))? as usize;
        headers.push(Header {
            name,
            shape,
            steps,
            payload_len,
        });
    }

    let mut entries = Vec::with_capacity(headers.len());
    for header in headers {
        let payload = reader
            .take(header.payload_len)
            .with_context(|| format!("reading payload of tensor {}", header.name))?;
        entries.push(Entry {
            name: header.name,
            shape: header.shape,
            steps: header.steps,
            payload,
        });
    }
    if reader.remaining() != 0 {
        return Err(anyhow!(
            "{} trailing bytes after the last payload",
            reader.remaining()
        ));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineStep, Quantize, Sparsify};

    fn dict() -> TensorDict {
        vec![
            (
                "dense/kernel".to_string(),
                Tensor::new(vec![2, 3], vec![0.1, -0.2, 0.3, -0.4, 0.5, -0.6]).unwrap(),
            ),
            ("dense/bias".to_string(), Tensor::scalar(0.25)),
            (
                "empty".to_string(),
                Tensor::new(vec![0], vec![]).unwrap(),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_identity_roundtrip_is_exact() {
        let original = dict();
        let pipeline = Pipeline::identity();
        let record = encode(&original, &pipeline).unwrap();
        let decoded = decode(&record, &pipeline).unwrap();
        assert_eq!(decoded, original);
        // insertion order survives the roundtrip too
        let names: Vec<_> = decoded.names().map(str::to_string).collect();
        assert_eq!(names, vec!["dense/kernel", "dense/bias", "empty"]);
    }

    #[test]
    fn test_lossy_roundtrip_keeps_names_and_shapes() {
        let original = dict();
        let pipeline = Pipeline::new(vec![
            PipelineStep::Sparsify(Sparsify::new(0.15).unwrap()),
            PipelineStep::Quantize(Quantize::new(64).unwrap()),
        ])
        .unwrap();
        let record = encode(&original, &pipeline).unwrap();
        let decoded = decode(&record, &pipeline).unwrap();
        assert_eq!(decoded.len(), original.len());
        for (name, tensor) in original.iter() {
            let roundtripped = decoded.get(name).unwrap();
            assert_eq!(roundtripped.shape(), tensor.shape());
        }
    }

    #[test]
    fn test_record_bytes_revalidate() {
        let record = encode(&dict(), &Pipeline::identity()).unwrap();
        let bytes = record.clone().into_bytes();
        assert_eq!(WeightRecord::from_bytes(bytes).unwrap(), record);
    }

    #[test]
    fn test_pipeline_mismatch_is_rejected() {
        let identity = Pipeline::identity();
        let lossy =
            Pipeline::new(vec![PipelineStep::Quantize(Quantize::new(16).unwrap())]).unwrap();
        let record = encode(&dict(), &identity).unwrap();
        match decode(&record, &lossy).unwrap_err() {
            CodecError::PipelineMismatch {
                name,
                recorded,
                provided,
            } => {
                assert_eq!(name, "dense/kernel");
                assert!(recorded.is_empty());
                assert_eq!(provided, vec![crate::pipeline::QUANTIZE_ID]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_malformed_records_are_rejected() {
        assert!(WeightRecord::from_bytes(vec![]).is_err());
        assert!(WeightRecord::from_bytes(b"NOPE\x01\x00\x00\x00\x00".to_vec()).is_err());
        // bad version
        assert!(WeightRecord::from_bytes(b"FWR1\x02\x00\x00\x00\x00".to_vec()).is_err());
        // valid empty record
        assert!(WeightRecord::from_bytes(b"FWR1\x01\x00\x00\x00\x00".to_vec()).is_ok());

        // truncated payload
        let mut bytes = encode(&dict(), &Pipeline::identity()).unwrap().into_bytes();
        bytes.pop();
        assert!(WeightRecord::from_bytes(bytes).is_err());

        // trailing garbage
        let mut bytes = encode(&dict(), &Pipeline::identity()).unwrap().into_bytes();
        bytes.push(0);
        assert!(WeightRecord::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_overflowing_shape_is_rejected() {
        // rank 3, every dimension u32::MAX: the element count cannot be
        // represented and the record must be rejected, not panic
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(b'w');
        bytes.push(3); // rank
        for _ in 0..3 {
            bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        }
        bytes.push(0); // no steps
        bytes.extend_from_slice(&0u32.to_be_bytes()); // empty payload

        let record = WeightRecord::from_bytes(bytes).unwrap();
        match decode(&record, &Pipeline::identity()).unwrap_err() {
            CodecError::Format(message) => assert!(message.contains("overflows")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_oversized_tensor_count_is_rejected() {
        // a count no honest header could hold must fail fast
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(WeightRecord::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_sparse_total_must_match_declared_shape() {
        // shape [3] but the sparse metadata claims 5 original elements
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(b'w');
        bytes.push(1); // rank
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.push(1); // one step
        bytes.push(crate::pipeline::SPARSIFY_ID);
        bytes.extend_from_slice(&8u32.to_be_bytes()); // meta: total + one index
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&4u32.to_be_bytes()); // payload: one float
        bytes.extend_from_slice(&1.0f32.to_be_bytes());

        let record = WeightRecord::from_bytes(bytes).unwrap();
        let pipeline =
            Pipeline::new(vec![PipelineStep::Sparsify(Sparsify::new(0.01).unwrap())]).unwrap();
        match decode(&record, &pipeline).unwrap_err() {
            CodecError::Format(message) => assert!(message.contains("sparse metadata")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_shape_payload_mismatch_is_rejected() {
        // hand-build a record whose payload holds 2 values for a 3-element shape
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(b'w');
        bytes.push(1); // rank
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.push(0); // no steps
        bytes.extend_from_slice(&8u32.to_be_bytes()); // payload: 2 floats
        bytes.extend_from_slice(&1.0f32.to_be_bytes());
        bytes.extend_from_slice(&2.0f32.to_be_bytes());

        let record = WeightRecord::from_bytes(bytes).unwrap();
        match decode(&record, &Pipeline::identity()).unwrap_err() {
            CodecError::Shape {
                name,
                expected,
                actual,
                ..
            } => {
                assert_eq!(name, "w");
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
