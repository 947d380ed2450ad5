//! The model abstraction and the model registry.
//!
//! A [`Model`] is the simulator's view of whatever learns locally at a
//! collaborator: it exposes its parameters as a tensor dictionary, accepts
//! updated parameters, trains for one round, validates and optionally runs
//! inference. The registry maps the plan's `model.kind` to a constructor.

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    fs::File,
    hash::{Hash, Hasher},
    io::{BufReader, BufWriter},
    path::Path,
};

use anyhow::Context;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;
use thiserror::Error;

use fedsim_core::tensor::{Tensor, TensorDict};

/// An error raised by a model implementation.
///
/// Models are plugged in from outside the simulator, so this is a flexible
/// error type rather than a closed enum.
pub type ModelError = anyhow::Error;

/// Options forwarded to a model when inference is run against it.
#[derive(Debug, Clone, Default)]
pub struct InferenceOptions {
    /// The number of inputs scored per batch; model-defined default when
    /// absent.
    pub batch_size: Option<usize>,
}

/// The simulator's view of a local learner.
pub trait Model: Send {
    /// Gets a snapshot of the model's parameters.
    fn tensor_dict(&self) -> TensorDict;

    /// Replaces the model's parameters.
    ///
    /// The dictionary contains every parameter the model exposes via
    /// [`tensor_dict`][Model::tensor_dict]; the model may reject
    /// dictionaries it cannot apply.
    fn set_tensor_dict(&mut self, dict: TensorDict) -> Result<(), ModelError>;

    /// Trains on the local data for one round.
    fn train_round(&mut self) -> Result<(), ModelError>;

    /// Evaluates the current parameters on the local validation data.
    fn validate(&mut self) -> Result<f64, ModelError>;

    /// Gets the number of local training samples, if known.
    fn sample_count(&self) -> Option<u64>;

    /// Loads parameters from a model-native file instead of a checkpoint.
    fn load_native(&mut self, path: &Path) -> Result<(), ModelError>;

    /// Runs inference over the local data and returns the outputs as JSON.
    fn run_inference(&mut self, options: &InferenceOptions) -> Result<serde_json::Value, ModelError>;
}

/// The local data handed to a model constructor.
pub use crate::roster::CollaboratorData;

type Constructor = Box<dyn Fn(&CollaboratorData) -> Result<Box<dyn Model>, ModelError> + Send + Sync>;

#[derive(Debug, Error)]
#[error("unknown model kind {kind:?}, registered kinds: {}", .known.join(", "))]
/// Error returned for a plan naming an unregistered model kind.
pub struct UnknownModelKind {
    pub kind: String,
    pub known: Vec<String>,
}

/// The registry of model constructors, keyed by the plan's `model.kind`.
pub struct ModelRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registers a constructor under `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&CollaboratorData) -> Result<Box<dyn Model>, ModelError> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Box::new(constructor));
    }

    /// Gets the registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// Builds a model of the given kind.
    pub fn build(
        &self,
        kind: &str,
        data: &CollaboratorData,
    ) -> Result<Box<dyn Model>, ModelError> {
        let constructor = self.constructors.get(kind).ok_or_else(|| UnknownModelKind {
            kind: kind.to_string(),
            known: self.kinds(),
        })?;
        constructor(data)
    }
}

impl Default for ModelRegistry {
    /// Creates a registry holding the built-in model kinds.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("random_walk", |data| {
            Ok(Box::new(RandomWalkModel::new(data)) as Box<dyn Model>)
        });
        registry
    }
}

/// A self-contained toy model for exercising the federation loop without a
/// learning framework: parameters decay towards zero under a small random
/// walk, and validation rewards small parameters.
pub struct RandomWalkModel {
    dict: TensorDict,
    rng: StdRng,
    sample_count: Option<u64>,
}

impl RandomWalkModel {
    const KERNEL: &'static str = "dense/kernel";
    const BIAS: &'static str = "dense/bias";
    const STEP: &'static str = "optimizer/step";

    /// Creates a model seeded from the collaborator's data path, so that
    /// distinct collaborators start from distinct parameters while a rerun
    /// of the same plan reproduces them.
    pub fn new(data: &CollaboratorData) -> Self {
        let mut hasher = DefaultHasher::new();
        data.data_path.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());

        let kernel: Vec<f32> = (0..8).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let mut dict = TensorDict::new();
        // the constructor controls the shapes, so the sizes always match
        dict.insert(
            Self::KERNEL,
            Tensor::new(vec![2, 4], kernel).unwrap_or_else(|_| Tensor::scalar(0.0)),
        );
        dict.insert(Self::BIAS, Tensor::scalar(rng.gen_range(-0.5..0.5)));
        dict.insert(Self::STEP, Tensor::scalar(0.0));

        Self {
            dict,
            rng,
            sample_count: data.sample_count,
        }
    }

    fn squared_norm(&self) -> f64 {
        self.dict
            .iter()
            .flat_map(|(_, tensor)| tensor.data().iter())
            .map(|value| (*value as f64).powi(2))
            .sum()
    }
}

impl Model for RandomWalkModel {
    fn tensor_dict(&self) -> TensorDict {
        self.dict.clone()
    }

    fn set_tensor_dict(&mut self, dict: TensorDict) -> Result<(), ModelError> {
        for name in self.dict.names() {
            if !dict.contains(name) {
                return Err(anyhow::anyhow!("parameter {} is missing", name));
            }
        }
        self.dict = dict;
        Ok(())
    }

    fn train_round(&mut self) -> Result<(), ModelError> {
        let step = match self.dict.get(Self::STEP) {
            Some(tensor) => tensor.data()[0] + 1.0,
            None => 1.0,
        };
        // the closure may only borrow the generator, not all of `self`,
        // while the dictionary is iterated
        let rng = &mut self.rng;
        let mut trained = TensorDict::new();
        for (name, tensor) in self.dict.iter() {
            if name == Self::STEP {
                trained.insert(name.clone(), Tensor::scalar(step));
                continue;
            }
            let data: Vec<f32> = tensor
                .data()
                .iter()
                .map(|value| value * 0.9 + rng.gen_range(-0.01..0.01))
                .collect();
            let shape = tensor.shape().to_vec();
            trained.insert(
                name.clone(),
                Tensor::new(shape, data).context("training produced a malformed tensor")?,
            );
        }
        self.dict = trained;
        Ok(())
    }

    fn validate(&mut self) -> Result<f64, ModelError> {
        Ok(1.0 / (1.0 + self.squared_norm()))
    }

    fn sample_count(&self) -> Option<u64> {
        self.sample_count
    }

    fn load_native(&mut self, path: &Path) -> Result<(), ModelError> {
        let file = File::open(path)
            .with_context(|| format!("failed to open native weights {}", path.display()))?;
        let dict: TensorDict = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse native weights {}", path.display()))?;
        self.set_tensor_dict(dict)
    }

    fn run_inference(&mut self, options: &InferenceOptions) -> Result<serde_json::Value, ModelError> {
        let batch_size = options.batch_size.unwrap_or(1);
        Ok(json!({
            "model": "random_walk",
            "batch_size": batch_size,
            "squared_norm": self.squared_norm(),
            "parameters": self.dict.names().collect::<Vec<_>>(),
        }))
    }
}

impl RandomWalkModel {
    /// Writes the current parameters in the model-native JSON format.
    pub fn save_native(&self, path: &Path) -> Result<(), ModelError> {
        let file = File::create(path)
            .with_context(|| format!("failed to create native weights {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), &self.dict)
            .with_context(|| format!("failed to write native weights {}", path.display()))
    }
}
