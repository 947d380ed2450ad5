//! Gated local inference against checkpointed or native weights.
//!
//! Inference is opt-in per federation plan: the plan must carry an
//! `[inference]` section with `allowed = true`, and the gate is checked
//! before any model or data is touched. The weights come from exactly one
//! source, either one of the run's checkpoints or a model-native weights
//! file.

use std::{fs, path::PathBuf};

use thiserror::Error;

use fedsim_core::{
    holdout::{self, Partition},
    pipeline::Pipeline,
    record,
};

use crate::{
    model::{InferenceOptions, ModelError, ModelRegistry},
    roster::CollaboratorData,
    settings::Settings,
    storage::{CheckpointName, CheckpointStore, StorageError},
};

#[derive(Debug, Error)]
/// An error related to running inference.
pub enum InferenceError {
    #[error("exactly one of --checkpoint and --native-weights must be given")]
    AmbiguousSource,
    #[error("a weight source is required: --checkpoint or --native-weights")]
    MissingSource,
    #[error("the federation plan does not allow inference")]
    NotAllowed,
    #[error("invalid federation plan: {0}")]
    Plan(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] fedsim_core::record::CodecError),
    #[error("model failure: {cause:#}")]
    Model { cause: ModelError },
    #[error("failed to write inference output to {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the weights for an inference run come from.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightSource {
    /// One of the run's checkpoints.
    Checkpoint(CheckpointName),
    /// A model-native weights file, bypassing the checkpoint store.
    Native(PathBuf),
}

impl WeightSource {
    /// Resolves the command line arguments into a single weight source.
    ///
    /// The two flags are mutually exclusive and one of them is required;
    /// this is checked before anything else so that a contradictory
    /// invocation never touches the store, the model or the data.
    pub fn from_args(
        checkpoint: Option<CheckpointName>,
        native_weights: Option<PathBuf>,
    ) -> Result<Self, InferenceError> {
        match (checkpoint, native_weights) {
            (Some(_), Some(_)) => Err(InferenceError::AmbiguousSource),
            (Some(name), None) => Ok(WeightSource::Checkpoint(name)),
            (None, Some(path)) => Ok(WeightSource::Native(path)),
            (None, None) => Err(InferenceError::MissingSource),
        }
    }
}

/// Runs inference for one collaborator and returns the model's outputs.
///
/// The order of checks is fixed: weight source resolution happens in
/// [`WeightSource::from_args`], then the plan's inference gate, and only
/// then is the model constructed and the data touched.
pub fn run(
    settings: &Settings,
    data: &CollaboratorData,
    registry: &ModelRegistry,
    source: WeightSource,
) -> Result<serde_json::Value, InferenceError> {
    let inference = match &settings.inference {
        Some(inference) if inference.allowed => inference,
        _ => return Err(InferenceError::NotAllowed),
    };

    let mut model = registry
        .build(&settings.model.kind, data)
        .map_err(|cause| InferenceError::Model { cause })?;

    match source {
        WeightSource::Checkpoint(name) => {
            let store = CheckpointStore::new(&settings.checkpoints.dir)?;
            let (record, meta) = store.load(name)?;
            info!(checkpoint = %name, round = meta.round, "loaded checkpoint for inference");

            // a checkpoint only holds the shared subset; the holdout
            // parameters keep the freshly constructed model's values
            let shared = record::decode(&record, &Pipeline::identity())?;
            let spec = settings
                .holdout
                .to_spec()
                .map_err(|err| InferenceError::Plan(err.to_string()))?;
            let Partition { holdout, .. } = holdout::split(model.tensor_dict(), &spec);
            let expected: Vec<String> = model.tensor_dict().names().map(str::to_string).collect();
            let merged = holdout::merge_complete(
                shared,
                holdout,
                expected.iter().map(String::as_str),
            )
            .map_err(|err| InferenceError::Plan(err.to_string()))?;
            model
                .set_tensor_dict(merged)
                .map_err(|cause| InferenceError::Model { cause })?;
        }
        WeightSource::Native(path) => {
            info!(path = %path.display(), "loading native weights for inference");
            model
                .load_native(&path)
                .map_err(|cause| InferenceError::Model { cause })?;
        }
    }

    let options = InferenceOptions {
        batch_size: inference.batch_size,
    };
    let outputs = model
        .run_inference(&options)
        .map_err(|cause| InferenceError::Model { cause })?;

    if let Some(dir) = &inference.output_dir {
        fs::create_dir_all(dir).map_err(|source| InferenceError::Output {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join("inference.json");
        let pretty = serde_json::to_string_pretty(&outputs).unwrap_or_else(|_| outputs.to_string());
        fs::write(&path, pretty).map_err(|source| InferenceError::Output {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "inference output written");
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::settings::{
        CheckpointSettings,
        HoldoutSettings,
        InferenceSettings,
        LoggingSettings,
        ModelSettings,
        RoundSettings,
        Settings,
    };
    use fedsim_core::tensor::{Tensor, TensorDict};

    fn settings(dir: PathBuf, inference: Option<InferenceSettings>) -> Settings {
        Settings {
            round: RoundSettings {
                limit: 1,
                fault_tolerant: false,
            },
            aggregation: Default::default(),
            holdout: HoldoutSettings {
                patterns: vec!["optimizer/*".to_string()],
            },
            pipeline: Default::default(),
            model: ModelSettings {
                kind: "random_walk".to_string(),
            },
            checkpoints: CheckpointSettings { dir },
            log: LoggingSettings {
                filter: "info".to_string(),
            },
            inference,
        }
    }

    fn allowed() -> Option<InferenceSettings> {
        Some(InferenceSettings {
            allowed: true,
            batch_size: Some(8),
            output_dir: None,
        })
    }

    fn data() -> CollaboratorData {
        CollaboratorData {
            data_path: PathBuf::from("data/site-a"),
            sample_count: Some(10),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fedsim-inference-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_weight_source_is_exclusive_and_required() {
        assert!(matches!(
            WeightSource::from_args(None, None).unwrap_err(),
            InferenceError::MissingSource
        ));
        assert!(matches!(
            WeightSource::from_args(Some(CheckpointName::Best), Some(PathBuf::from("w.json")))
                .unwrap_err(),
            InferenceError::AmbiguousSource
        ));
        assert_eq!(
            WeightSource::from_args(Some(CheckpointName::Latest), None).unwrap(),
            WeightSource::Checkpoint(CheckpointName::Latest)
        );
        assert_eq!(
            WeightSource::from_args(None, Some(PathBuf::from("w.json"))).unwrap(),
            WeightSource::Native(PathBuf::from("w.json"))
        );
    }

    #[test]
    fn test_gate_rejects_before_touching_anything() {
        // checkpoint dir does not exist and the model kind is bogus, but
        // the gate fires first
        let mut settings = settings(PathBuf::from("/nonexistent"), None);
        settings.model.kind = "bogus".to_string();
        let err = run(
            &settings,
            &data(),
            &ModelRegistry::default(),
            WeightSource::Checkpoint(CheckpointName::Best),
        )
        .unwrap_err();
        assert!(matches!(err, InferenceError::NotAllowed));

        settings.inference = Some(InferenceSettings {
            allowed: false,
            batch_size: None,
            output_dir: None,
        });
        let err = run(
            &settings,
            &data(),
            &ModelRegistry::default(),
            WeightSource::Checkpoint(CheckpointName::Best),
        )
        .unwrap_err();
        assert!(matches!(err, InferenceError::NotAllowed));
    }

    #[test]
    fn test_inference_from_checkpoint() {
        let dir = temp_dir("checkpoint");
        let store = CheckpointStore::new(&dir).unwrap();

        // checkpoint the shapes the built-in model exposes, shared only
        let mut shared_weights = TensorDict::new();
        shared_weights.insert("dense/kernel", Tensor::new(vec![2, 4], vec![0.0; 8]).unwrap());
        shared_weights.insert("dense/bias", Tensor::scalar(0.0));
        let record = record::encode(&shared_weights, &Pipeline::identity()).unwrap();
        store
            .save(
                CheckpointName::Best,
                &record,
                &crate::storage::CheckpointMeta::new(2, Some(0.9)),
            )
            .unwrap();

        let outputs = run(
            &settings(dir.clone(), allowed()),
            &data(),
            &ModelRegistry::default(),
            WeightSource::Checkpoint(CheckpointName::Best),
        )
        .unwrap();
        // all shared weights were zeroed by the checkpoint, and the
        // held-out optimizer step starts at zero
        assert_eq!(outputs["squared_norm"], 0.0);
        assert_eq!(outputs["batch_size"], 8);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_inference_writes_output_file() {
        let dir = temp_dir("output");
        let out = dir.join("out");
        let store = CheckpointStore::new(&dir).unwrap();
        let mut shared_weights = TensorDict::new();
        shared_weights.insert("dense/kernel", Tensor::new(vec![2, 4], vec![0.0; 8]).unwrap());
        shared_weights.insert("dense/bias", Tensor::scalar(0.0));
        let record = record::encode(&shared_weights, &Pipeline::identity()).unwrap();
        store
            .save(
                CheckpointName::Latest,
                &record,
                &crate::storage::CheckpointMeta::new(1, Some(0.5)),
            )
            .unwrap();

        let inference = Some(InferenceSettings {
            allowed: true,
            batch_size: None,
            output_dir: Some(out.clone()),
        });
        run(
            &settings(dir.clone(), inference),
            &data(),
            &ModelRegistry::default(),
            WeightSource::Checkpoint(CheckpointName::Latest),
        )
        .unwrap();
        let written = fs::read_to_string(out.join("inference.json")).unwrap();
        assert!(written.contains("squared_norm"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_inference_from_native_weights() {
        let dir = temp_dir("native");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("weights.json");
        let model = crate::model::RandomWalkModel::new(&data());
        model.save_native(&path).unwrap();

        let outputs = run(
            &settings(dir.clone(), allowed()),
            &data(),
            &ModelRegistry::default(),
            WeightSource::Native(path),
        )
        .unwrap();
        assert!(outputs["squared_norm"].as_f64().is_some());

        fs::remove_dir_all(&dir).unwrap();
    }
}
