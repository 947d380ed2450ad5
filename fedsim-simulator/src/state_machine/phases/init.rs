use fedsim_core::{pipeline::Pipeline, record};

use super::{Finished, Phase, PhaseName, PhaseState, RoundInProgress, Shared, Transition};
use crate::{
    state_machine::SimulationError,
    storage::{CheckpointMeta, CheckpointName},
};

/// The init phase: establishes the initial global shared weights.
///
/// When an `init` checkpoint already exists in the store, the run resumes
/// from it; otherwise the shared subset of the first collaborator's
/// initial parameters becomes the initial global model and is written as
/// the `init` checkpoint.
#[derive(Debug)]
pub struct Init;

impl PhaseState<Init> {
    /// Creates a new init state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Init,
            shared,
        }
    }
}

impl Phase for PhaseState<Init> {
    const NAME: PhaseName = PhaseName::Init;

    fn process(&mut self) -> Result<(), SimulationError> {
        // checkpoints are always stored with the identity pipeline; the
        // plan pipeline only applies to the collaborator exchange
        let identity = Pipeline::identity();

        if self.shared.store.exists(CheckpointName::Init) {
            let (record, meta) = self.shared.store.load(CheckpointName::Init)?;
            self.shared.global =
                record::decode(&record, &identity).map_err(|source| SimulationError::Codec {
                    round: 0,
                    source,
                })?;
            info!(round = meta.round, "resumed initial weights from checkpoint");
            return Ok(());
        }

        let first = self
            .shared
            .collaborators
            .first()
            .ok_or(SimulationError::Internal("no collaborators"))?;
        self.shared.global = first.shared_tensors(&self.shared.spec);
        info!(
            collaborator = %first.id(),
            tensors = self.shared.global.len(),
            "seeded initial weights"
        );

        let record =
            record::encode(&self.shared.global, &identity).map_err(|source| {
                SimulationError::Codec { round: 0, source }
            })?;
        self.shared
            .store
            .save(CheckpointName::Init, &record, &CheckpointMeta::new(0, None))?;
        Ok(())
    }

    fn next(self) -> Transition {
        if self.shared.stop.is_stopped() {
            info!("stop requested before the first round");
            return Transition::Next(PhaseState::<Finished>::new(self.shared).into());
        }
        Transition::Next(PhaseState::<RoundInProgress>::new(self.shared).into())
    }
}
