//! Loading and validation of the federation plan.
//!
//! Values defined in the configuration file can be overridden by
//! environment variables with the `FEDSIM_` prefix, sections separated by
//! double underscores.

use std::{fmt, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedsim_core::{
    holdout::HoldoutSpec,
    pipeline::{Pipeline, PipelineStep, Quantize, Sparsify},
};

#[derive(Error, Debug)]
/// An error related to loading and validation of the federation plan.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined federation plan.
///
/// Each section in the configuration file corresponds to the identically
/// named settings field.
pub struct Settings {
    #[validate]
    pub round: RoundSettings,
    #[serde(default)]
    pub aggregation: AggregationSettings,
    #[validate]
    #[serde(default)]
    pub holdout: HoldoutSettings,
    #[validate]
    #[serde(default)]
    pub pipeline: PipelineSettings,
    pub model: ModelSettings,
    pub checkpoints: CheckpointSettings,
    pub log: LoggingSettings,
    /// Optional; inference stays disabled when the section is absent.
    pub inference: Option<InferenceSettings>,
}

impl Settings {
    /// Loads and validates the federation plan via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedsim").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Round settings.
pub struct RoundSettings {
    /// The number of training rounds to run.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// limit = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_ROUND__LIMIT=10
    /// ```
    #[validate(range(min = 1))]
    pub limit: u32,

    /// Whether a round tolerates individual collaborator failures.
    ///
    /// When enabled, a failing collaborator is excluded from the round's
    /// aggregation and the round proceeds with the remaining results; a
    /// round in which every collaborator fails still aborts the run. When
    /// disabled, the first failure aborts the run.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// fault_tolerant = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_ROUND__FAULT_TOLERANT=true
    /// ```
    #[serde(default)]
    pub fault_tolerant: bool,
}

/// How collaborator contributions are weighted during aggregation.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// Weight each contribution by the collaborator's sample count.
    SampleCount,
    /// Weight every contribution equally.
    Equal,
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Aggregation settings.
pub struct AggregationSettings {
    /// The contribution weighting scheme.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// weighting = "sample_count"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_AGGREGATION__WEIGHTING=sample_count
    /// ```
    pub weighting: Weighting,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            weighting: Weighting::SampleCount,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Default)]
#[validate(schema(function = "validate_holdout"))]
/// Holdout settings.
pub struct HoldoutSettings {
    /// Name patterns of tensors that never leave a collaborator: an exact
    /// name, `prefix*` or `*suffix`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [holdout]
    /// patterns = ["optimizer/*", "*_local"]
    /// ```
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl HoldoutSettings {
    /// Builds the holdout specification declared by this plan.
    pub fn to_spec(&self) -> Result<HoldoutSpec, ValidationError> {
        HoldoutSpec::parse(&self.patterns).map_err(|_| ValidationError::new("invalid holdout pattern"))
    }
}

/// A wrapper for validate derive.
fn validate_holdout(s: &HoldoutSettings) -> Result<(), ValidationError> {
    s.to_spec().map(|_| ())
}

/// The kind of a configured pipeline step.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    NoCompression,
    Quantize,
    Sparsify,
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// One step of the configured transformation pipeline.
pub struct StepSettings {
    /// The step kind.
    pub kind: StepKind,
    /// The number of quantization levels; required for `quantize`.
    pub levels: Option<u16>,
    /// The magnitude threshold; required for `sparsify`.
    pub threshold: Option<f32>,
}

impl StepSettings {
    fn to_step(&self) -> Result<PipelineStep, ValidationError> {
        match (self.kind, self.levels, self.threshold) {
            (StepKind::NoCompression, None, None) => Ok(PipelineStep::NoCompression),
            (StepKind::Quantize, Some(levels), None) => Quantize::new(levels)
                .map(PipelineStep::Quantize)
                .map_err(|_| ValidationError::new("invalid quantization levels")),
            (StepKind::Sparsify, None, Some(threshold)) => Sparsify::new(threshold)
                .map(PipelineStep::Sparsify)
                .map_err(|_| ValidationError::new("invalid sparsification threshold")),
            _ => Err(ValidationError::new("invalid pipeline step parameters")),
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Default)]
#[validate(schema(function = "validate_pipeline"))]
/// Transformation pipeline settings. An empty step list is the identity
/// pipeline.
pub struct PipelineSettings {
    /// The pipeline steps, applied in order to every exchanged tensor.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [[pipeline.steps]]
    /// kind = "sparsify"
    /// threshold = 0.001
    ///
    /// [[pipeline.steps]]
    /// kind = "quantize"
    /// levels = 256
    /// ```
    #[serde(default)]
    pub steps: Vec<StepSettings>,
}

impl PipelineSettings {
    /// Builds the transformation pipeline declared by this plan.
    pub fn to_pipeline(&self) -> Result<Pipeline, ValidationError> {
        let steps = self
            .steps
            .iter()
            .map(StepSettings::to_step)
            .collect::<Result<Vec<_>, _>>()?;
        Pipeline::new(steps).map_err(|_| ValidationError::new("invalid pipeline step order"))
    }
}

/// A wrapper for validate derive.
fn validate_pipeline(s: &PipelineSettings) -> Result<(), ValidationError> {
    s.to_pipeline().map(|_| ())
}

#[derive(Debug, Deserialize, Clone)]
/// Model settings.
pub struct ModelSettings {
    /// The registered model kind every collaborator instantiates.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// kind = "random_walk"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_MODEL__KIND=random_walk
    /// ```
    pub kind: String,
}

#[derive(Debug, Deserialize, Clone)]
/// Checkpoint settings.
pub struct CheckpointSettings {
    /// The directory the init/best/latest checkpoints are written to.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [checkpoints]
    /// dir = "save"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_CHECKPOINTS__DIR=save
    /// ```
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
/// Inference settings.
///
/// Unknown fields are rejected rather than ignored so that a typo cannot
/// silently grant or withhold inference.
pub struct InferenceSettings {
    /// Whether running inference against checkpoints of this plan is
    /// permitted. Absent section and absent field both mean "no".
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [inference]
    /// allowed = true
    /// ```
    #[serde(default)]
    pub allowed: bool,

    /// The number of inputs scored per batch.
    pub batch_size: Option<usize>,

    /// The directory inference outputs are written to.
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info,fedsim_simulator=debug"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_filter_directives")]
    pub filter: String,
}

impl LoggingSettings {
    /// Builds the filter from the validated directives.
    pub fn to_filter(&self) -> EnvFilter {
        EnvFilter::new(&self.filter)
    }
}

fn deserialize_filter_directives<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct FilterDirectivesVisitor;

    impl<'de> Visitor<'de> for FilterDirectivesVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map(|_| value.to_string())
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(FilterDirectivesVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    const PLAN: &str = r#"
        [round]
        limit = 5
        fault_tolerant = true

        [aggregation]
        weighting = "equal"

        [holdout]
        patterns = ["optimizer/*", "*_local"]

        [[pipeline.steps]]
        kind = "sparsify"
        threshold = 0.001

        [[pipeline.steps]]
        kind = "quantize"
        levels = 256

        [model]
        kind = "random_walk"

        [checkpoints]
        dir = "save"

        [log]
        filter = "info"

        [inference]
        allowed = true
        batch_size = 32
    "#;

    fn write_plan(name: &str, contents: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("fedsim-settings-{}-{}.toml", name, std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_settings_new() {
        let path = write_plan("full", PLAN);
        let settings = Settings::new(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(settings.round.limit, 5);
        assert!(settings.round.fault_tolerant);
        assert_eq!(settings.aggregation.weighting, Weighting::Equal);
        assert_eq!(settings.holdout.patterns.len(), 2);
        assert_eq!(settings.pipeline.steps.len(), 2);
        assert_eq!(settings.model.kind, "random_walk");
        assert!(settings.inference.unwrap().allowed);

        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_optional_sections_default() {
        let plan = r#"
            [round]
            limit = 1

            [model]
            kind = "random_walk"

            [checkpoints]
            dir = "save"

            [log]
            filter = "info"
        "#;
        let path = write_plan("minimal", plan);
        let settings = Settings::new(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(!settings.round.fault_tolerant);
        assert_eq!(settings.aggregation.weighting, Weighting::SampleCount);
        assert!(settings.holdout.patterns.is_empty());
        assert_eq!(settings.pipeline.to_pipeline().unwrap(), Pipeline::identity());
        assert!(settings.inference.is_none());
    }

    #[test]
    fn test_round_limit_must_be_positive() {
        let plan = PLAN.replace("limit = 5", "limit = 0");
        let path = write_plan("zero-rounds", &plan);
        assert!(Settings::new(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_bad_holdout_pattern_is_rejected() {
        let plan = PLAN.replace("\"optimizer/*\"", "\"opti*mizer\"");
        let path = write_plan("bad-pattern", &plan);
        assert!(Settings::new(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_misordered_pipeline_is_rejected() {
        // quantize must come last
        let settings = PipelineSettings {
            steps: vec![
                StepSettings {
                    kind: StepKind::Quantize,
                    levels: Some(16),
                    threshold: None,
                },
                StepSettings {
                    kind: StepKind::NoCompression,
                    levels: None,
                    threshold: None,
                },
            ],
        };
        assert!(settings.to_pipeline().is_err());
    }

    #[test]
    fn test_step_parameters_must_match_kind() {
        let step = StepSettings {
            kind: StepKind::Quantize,
            levels: None,
            threshold: Some(0.1),
        };
        assert!(step.to_step().is_err());
    }

    #[test]
    fn test_unknown_inference_field_is_rejected() {
        let plan = PLAN.replace("allowed = true", "alowed = true");
        let path = write_plan("typo-inference", &plan);
        assert!(Settings::new(&path).is_err());
        fs::remove_file(&path).unwrap();
    }
}
