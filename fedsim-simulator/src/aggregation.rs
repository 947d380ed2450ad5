//! Weighted aggregation of collaborator contributions.
//!
//! The aggregator computes the weighted element-wise mean of the shared
//! tensors every contributing collaborator reported for a round, and the
//! weighted mean of their validation scores. Accumulation runs in `f64`
//! and contributions are processed in collaborator-id order, so the result
//! does not depend on the order results arrive in.

use thiserror::Error;

use fedsim_core::tensor::{Tensor, TensorDict};

use crate::settings::Weighting;

#[derive(Debug, Error, PartialEq)]
/// An error related to aggregating a round's contributions.
pub enum AggregationError {
    #[error("no contributions to aggregate")]
    Empty,
    #[error("the total contribution weight is zero")]
    ZeroWeight,
    #[error("collaborator {id} did not report tensor {name}")]
    MissingTensor { id: String, name: String },
    #[error("collaborator {id} reported unexpected tensor {name}")]
    UnexpectedTensor { id: String, name: String },
    #[error("collaborator {id} reported tensor {name} with shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        id: String,
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// One collaborator's decoded contribution to a round.
#[derive(Debug, Clone)]
pub struct DecodedContribution {
    pub id: String,
    pub tensors: TensorDict,
    pub score: f64,
    pub sample_count: Option<u64>,
}

/// The aggregate of a round.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// The new global shared weights.
    pub tensors: TensorDict,
    /// The weighted mean of the contributors' validation scores.
    pub score: f64,
}

/// Gets the aggregation weight of a contribution under `weighting`.
///
/// A contribution without a sample count falls back to a weight of one
/// under sample-count weighting.
pub fn contribution_weight(contribution: &DecodedContribution, weighting: Weighting) -> f64 {
    match weighting {
        Weighting::Equal => 1.0,
        Weighting::SampleCount => match contribution.sample_count {
            Some(samples) => samples as f64,
            None => {
                warn!(
                    id = %contribution.id,
                    "no sample count available, weighting the contribution as one sample"
                );
                1.0
            }
        },
    }
}

/// Aggregates a round's contributions into the new global shared weights.
///
/// The first contribution (in id order) defines the expected tensor names
/// and shapes; every other contribution must match it exactly.
pub fn aggregate(
    mut contributions: Vec<DecodedContribution>,
    weighting: Weighting,
) -> Result<Aggregate, AggregationError> {
    if contributions.is_empty() {
        return Err(AggregationError::Empty);
    }
    contributions.sort_by(|a, b| a.id.cmp(&b.id));

    let weights: Vec<f64> = contributions
        .iter()
        .map(|contribution| contribution_weight(contribution, weighting))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(AggregationError::ZeroWeight);
    }

    let reference = &contributions[0];
    let mut sums: Vec<(String, Vec<usize>, Vec<f64>)> = reference
        .tensors
        .iter()
        .map(|(name, tensor)| {
            (
                name.clone(),
                tensor.shape().to_vec(),
                vec![0.0; tensor.len()],
            )
        })
        .collect();

    let mut score = 0.0;
    for (contribution, weight) in contributions.iter().zip(weights.iter()) {
        for (name, _) in contribution.tensors.iter() {
            if !reference.tensors.contains(name) {
                return Err(AggregationError::UnexpectedTensor {
                    id: contribution.id.clone(),
                    name: name.clone(),
                });
            }
        }
        for (name, shape, sum) in sums.iter_mut() {
            let tensor =
                contribution
                    .tensors
                    .get(name)
                    .ok_or_else(|| AggregationError::MissingTensor {
                        id: contribution.id.clone(),
                        name: name.clone(),
                    })?;
            if tensor.shape() != shape.as_slice() {
                return Err(AggregationError::ShapeMismatch {
                    id: contribution.id.clone(),
                    name: name.clone(),
                    expected: shape.clone(),
                    actual: tensor.shape().to_vec(),
                });
            }
            for (slot, value) in sum.iter_mut().zip(tensor.data().iter()) {
                *slot += weight * *value as f64;
            }
        }
        score += weight * contribution.score;
    }

    let tensors = sums
        .into_iter()
        .map(|(name, shape, sum)| {
            let data: Vec<f32> = sum.into_iter().map(|value| (value / total) as f32).collect();
            // shape and length come from the reference tensor
            let tensor = Tensor::new(shape, data).unwrap_or_else(|_| Tensor::scalar(0.0));
            (name, tensor)
        })
        .collect();

    Ok(Aggregate {
        tensors,
        score: score / total,
    })
}
