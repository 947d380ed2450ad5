//! Tensors and tensor dictionaries.
//!
//! A [`TensorDict`] is the unit of exchange between a model and the
//! federation layer: an insertion-ordered mapping from parameter name to a
//! fixed-shape [`Tensor`].

use std::{iter::FromIterator, slice::Iter, vec::IntoIter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("shape {shape:?} requires {expected} elements but {actual} were given")]
/// Error returned when a tensor's data does not fill its shape.
pub struct ShapeMismatch {
    shape: Vec<usize>,
    expected: usize,
    actual: usize,
}

/// A named model parameter: a fixed shape and its values in row-major order.
///
/// A rank-0 tensor (empty shape) holds exactly one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ShapeMismatch> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a rank-0 tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Gets the shape of this tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Gets the values of this tensor in row-major order.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Gets the number of elements of this tensor.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl From<f32> for Tensor {
    fn from(value: f32) -> Self {
        Tensor::scalar(value)
    }
}

/// An insertion-ordered mapping from parameter name to [`Tensor`].
///
/// Names are unique within a dictionary; re-inserting a name replaces the
/// value while keeping the original position. Dictionaries are passed by
/// value across component boundaries, there is no shared mutable ownership.
///
/// Equality is name-to-value equality and ignores insertion order, since
/// the federation protocol only requires name/value fidelity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TensorDict(Vec<(String, Tensor)>);

impl TensorDict {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor under `name`, replacing the previous value in place
    /// if the name is already present.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = tensor,
            None => self.0.push((name, tensor)),
        }
    }

    /// Gets the tensor stored under `name`.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Checks whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    /// Removes and returns the tensor stored under `name`.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        let index = self.0.iter().position(|(n, _)| n == name)?;
        Some(self.0.remove(index).1)
    }

    /// Gets the number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Creates an iterator over `(name, tensor)` entries in insertion order.
    pub fn iter(&self) -> Iter<(String, Tensor)> {
        self.0.iter()
    }

    /// Creates an iterator over the names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }
}

impl PartialEq for TensorDict {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .all(|(name, tensor)| other.get(name) == Some(tensor))
    }
}

impl FromIterator<(String, Tensor)> for TensorDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut dict = TensorDict::new();
        for (name, tensor) in iter {
            dict.insert(name, tensor);
        }
        dict
    }
}

impl IntoIterator for TensorDict {
    type Item = (String, Tensor);
    type IntoIter = IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
