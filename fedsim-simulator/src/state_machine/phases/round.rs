use rayon::prelude::*;

use fedsim_core::record;

use super::{Phase, PhaseName, PhaseState, RoundComplete, Shared, Transition};
use crate::{
    aggregation::{self, Aggregate, DecodedContribution},
    collaborator::Contribution,
    model::ModelError,
    state_machine::SimulationError,
};

/// The round phase: broadcasts the global weights, trains every
/// collaborator in parallel and aggregates the results.
#[derive(Default)]
pub struct RoundInProgress {
    aggregate: Option<Aggregate>,
}

impl PhaseState<RoundInProgress> {
    /// Creates a new round state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: RoundInProgress::default(),
            shared,
        }
    }

    fn collect_contributions(
        &mut self,
    ) -> Result<Vec<Contribution>, SimulationError> {
        let round = self.shared.round;
        let broadcast = record::encode(&self.shared.global, &self.shared.pipeline)
            .map_err(|source| SimulationError::Codec { round, source })?;
        debug!(bytes = broadcast.len(), "broadcast encoded");

        // rayon borrows the collaborators mutably, so the plan data the
        // closure reads is cloned out of the shared state first
        let spec = self.shared.spec.clone();
        let pipeline = self.shared.pipeline.clone();
        let results: Vec<(String, Result<Contribution, ModelError>)> = self
            .shared
            .collaborators
            .par_iter_mut()
            .map(|collaborator| {
                let id = collaborator.id().to_string();
                (id, collaborator.run_round(&broadcast, &spec, &pipeline))
            })
            .collect();

        let fault_tolerant = self.shared.fault_tolerant;
        let mut contributions = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(contribution) => contributions.push(contribution),
                Err(cause) if fault_tolerant => {
                    warn!(
                        collaborator = %id,
                        round,
                        error = %format!("{:#}", cause),
                        "collaborator failed, excluding it from this round"
                    );
                }
                Err(cause) => {
                    return Err(SimulationError::Collaborator { id, round, cause });
                }
            }
        }
        Ok(contributions)
    }
}

impl Phase for PhaseState<RoundInProgress> {
    const NAME: PhaseName = PhaseName::RoundInProgress;

    fn process(&mut self) -> Result<(), SimulationError> {
        let round = self.shared.round;
        info!(
            round,
            collaborators = self.shared.collaborators.len(),
            "running training round"
        );

        let contributions = self.collect_contributions()?;
        info!(round, contributions = contributions.len(), "round trained");

        let decoded = contributions
            .into_iter()
            .map(|contribution| {
                let tensors = record::decode(&contribution.record, &self.shared.pipeline)
                    .map_err(|source| SimulationError::Codec { round, source })?;
                Ok(DecodedContribution {
                    id: contribution.id,
                    tensors,
                    score: contribution.score,
                    sample_count: contribution.sample_count,
                })
            })
            .collect::<Result<Vec<_>, SimulationError>>()?;

        let aggregate = aggregation::aggregate(decoded, self.shared.weighting)
            .map_err(|source| SimulationError::Aggregation { round, source })?;
        self.private.aggregate = Some(aggregate);
        Ok(())
    }

    fn next(self) -> Transition {
        match self.private.aggregate {
            Some(aggregate) => {
                Transition::Next(PhaseState::<RoundComplete>::new(self.shared, aggregate).into())
            }
            None => Transition::Next(
                PhaseState::<super::Failure>::new(
                    self.shared,
                    SimulationError::Internal("the round produced no aggregate"),
                )
                .into(),
            ),
        }
    }
}
