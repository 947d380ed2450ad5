use fedsim_core::{pipeline::Pipeline, record};

use super::{Finished, Phase, PhaseName, PhaseState, RoundInProgress, Shared, Transition};
use crate::{
    aggregation::Aggregate,
    state_machine::SimulationError,
    storage::{CheckpointMeta, CheckpointName},
};

/// The round-complete phase: installs the aggregate as the new global
/// weights and updates the `latest` and `best` checkpoints.
pub struct RoundComplete {
    aggregate: Aggregate,
}

impl PhaseState<RoundComplete> {
    /// Creates a new round-complete state.
    pub fn new(shared: Shared, aggregate: Aggregate) -> Self {
        Self {
            private: RoundComplete { aggregate },
            shared,
        }
    }
}

impl Phase for PhaseState<RoundComplete> {
    const NAME: PhaseName = PhaseName::RoundComplete;

    fn process(&mut self) -> Result<(), SimulationError> {
        let round = self.shared.round;
        let score = self.private.aggregate.score;
        self.shared.global = self.private.aggregate.tensors.clone();

        let record = record::encode(&self.shared.global, &Pipeline::identity())
            .map_err(|source| SimulationError::Codec { round, source })?;
        let meta = CheckpointMeta::new(round, Some(score));
        self.shared
            .store
            .save(CheckpointName::Latest, &record, &meta)?;

        // only a strict improvement replaces the best checkpoint
        let improved = self
            .shared
            .best_score
            .map_or(true, |best| score > best);
        if improved {
            self.shared
                .store
                .save(CheckpointName::Best, &record, &meta)?;
            self.shared.best_score = Some(score);
            info!(round, score, "new best model");
        } else {
            info!(round, score, "round completed without improvement");
        }

        self.shared.rounds_completed = round;
        Ok(())
    }

    fn next(mut self) -> Transition {
        if self.shared.should_finish() {
            return Transition::Next(PhaseState::<Finished>::new(self.shared).into());
        }
        self.shared.round += 1;
        Transition::Next(PhaseState::<RoundInProgress>::new(self.shared).into())
    }
}
