//! A simulated collaborator.
//!
//! Each collaborator owns its model and its holdout tensors. The holdout
//! tensors never appear in a weight record: they are split off before
//! encoding and merged back when the aggregated shared weights arrive.

use fedsim_core::{
    holdout::{self, HoldoutSpec, Partition},
    pipeline::Pipeline,
    record::{self, WeightRecord},
    tensor::TensorDict,
};

use crate::model::{Model, ModelError};

/// The result one collaborator reports back for a round.
pub struct Contribution {
    /// The collaborator that produced this contribution.
    pub id: String,
    /// The trained shared weights.
    pub record: WeightRecord,
    /// The local validation score after training.
    pub score: f64,
    /// The local sample count, if known.
    pub sample_count: Option<u64>,
}

/// One collaborator of the federation: a model plus the holdout tensors
/// kept out of every exchange.
pub struct Collaborator {
    id: String,
    model: Box<dyn Model>,
    holdout: TensorDict,
}

impl Collaborator {
    /// Creates a collaborator, splitting the model's initial parameters so
    /// the holdout subset stays local from the very first round.
    pub fn new(id: impl Into<String>, model: Box<dyn Model>, spec: &HoldoutSpec) -> Self {
        let Partition { holdout, .. } = holdout::split(model.tensor_dict(), spec);
        Self {
            id: id.into(),
            model,
            holdout,
        }
    }

    /// Gets the collaborator id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the shared subset of the model's current parameters.
    pub fn shared_tensors(&self, spec: &HoldoutSpec) -> TensorDict {
        holdout::split(self.model.tensor_dict(), spec).shared
    }

    /// Gets the local sample count, if known.
    pub fn sample_count(&self) -> Option<u64> {
        self.model.sample_count()
    }

    /// Runs one training round against the broadcast global weights.
    ///
    /// Decodes the broadcast, merges the local holdout tensors back in,
    /// trains and validates, then splits and encodes the trained shared
    /// weights. The refreshed holdout subset replaces the stored one only
    /// after every step succeeded, so a failed round leaves the
    /// collaborator as it was.
    pub fn run_round(
        &mut self,
        broadcast: &WeightRecord,
        spec: &HoldoutSpec,
        pipeline: &Pipeline,
    ) -> Result<Contribution, ModelError> {
        let shared = record::decode(broadcast, pipeline)?;
        let expected: Vec<String> = self.model.tensor_dict().names().map(str::to_string).collect();
        let merged = holdout::merge_complete(
            shared,
            self.holdout.clone(),
            expected.iter().map(String::as_str),
        )?;
        self.model.set_tensor_dict(merged)?;

        self.model.train_round()?;
        let score = self.model.validate()?;

        let Partition { shared, holdout } = holdout::split(self.model.tensor_dict(), spec);
        let record = record::encode(&shared, pipeline)?;
        self.holdout = holdout;

        Ok(Contribution {
            id: self.id.clone(),
            record,
            score,
            sample_count: self.model.sample_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsim_core::tensor::Tensor;

    /// A minimal deterministic model for orchestration tests: adds a fixed
    /// delta to its single shared weight each round.
    pub(crate) struct FixedStepModel {
        pub dict: TensorDict,
        pub delta: f32,
        pub score: f64,
        pub samples: Option<u64>,
    }

    impl FixedStepModel {
        pub fn new(weight: f32, local: f32, delta: f32, score: f64, samples: Option<u64>) -> Self {
            let mut dict = TensorDict::new();
            dict.insert("w", Tensor::scalar(weight));
            dict.insert("local_state", Tensor::scalar(local));
            Self {
                dict,
                delta,
                score,
                samples,
            }
        }
    }

    impl Model for FixedStepModel {
        fn tensor_dict(&self) -> TensorDict {
            self.dict.clone()
        }

        fn set_tensor_dict(&mut self, dict: TensorDict) -> Result<(), ModelError> {
            self.dict = dict;
            Ok(())
        }

        fn train_round(&mut self) -> Result<(), ModelError> {
            let w = self.dict.get("w").unwrap().data()[0] + self.delta;
            let local = self.dict.get("local_state").unwrap().data()[0] + 1.0;
            self.dict.insert("w", Tensor::scalar(w));
            self.dict.insert("local_state", Tensor::scalar(local));
            Ok(())
        }

        fn validate(&mut self) -> Result<f64, ModelError> {
            Ok(self.score)
        }

        fn sample_count(&self) -> Option<u64> {
            self.samples
        }

        fn load_native(&mut self, _path: &std::path::Path) -> Result<(), ModelError> {
            Err(anyhow::anyhow!("no native format"))
        }

        fn run_inference(
            &mut self,
            _options: &crate::model::InferenceOptions,
        ) -> Result<serde_json::Value, ModelError> {
            Ok(serde_json::json!({ "w": self.dict.get("w").unwrap().data()[0] }))
        }
    }

    fn spec() -> HoldoutSpec {
        HoldoutSpec::parse(vec!["local_*"]).unwrap()
    }

    #[test]
    fn test_holdout_never_enters_the_record() {
        let model = Box::new(FixedStepModel::new(1.0, 7.0, 0.5, 0.9, Some(10)));
        let spec = spec();
        let pipeline = Pipeline::identity();
        let mut collaborator = Collaborator::new("clinic-a", model, &spec);

        let shared = collaborator.shared_tensors(&spec);
        assert!(shared.contains("w"));
        assert!(!shared.contains("local_state"));

        let broadcast = record::encode(&shared, &pipeline).unwrap();
        let contribution = collaborator
            .run_round(&broadcast, &spec, &pipeline)
            .unwrap();
        let trained = record::decode(&contribution.record, &pipeline).unwrap();
        assert!(!trained.contains("local_state"));
        assert_eq!(trained.get("w").unwrap().data(), &[1.5]);
        assert_eq!(contribution.score, 0.9);
        assert_eq!(contribution.sample_count, Some(10));
    }

    #[test]
    fn test_holdout_state_carries_across_rounds() {
        let model = Box::new(FixedStepModel::new(0.0, 0.0, 1.0, 0.5, None));
        let spec = spec();
        let pipeline = Pipeline::identity();
        let mut collaborator = Collaborator::new("clinic-a", model, &spec);

        let broadcast = record::encode(&collaborator.shared_tensors(&spec), &pipeline).unwrap();
        collaborator.run_round(&broadcast, &spec, &pipeline).unwrap();
        collaborator.run_round(&broadcast, &spec, &pipeline).unwrap();

        // local_state was incremented once per round and survived both merges
        assert_eq!(
            collaborator.holdout.get("local_state").unwrap().data(),
            &[2.0]
        );
    }
}
