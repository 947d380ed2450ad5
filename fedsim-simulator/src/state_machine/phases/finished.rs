use super::{Phase, PhaseName, PhaseState, Shared, Transition};
use crate::state_machine::SimulationError;

/// The terminal phase of a successful run.
#[derive(Debug)]
pub struct Finished;

impl PhaseState<Finished> {
    /// Creates a new finished state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Finished,
            shared,
        }
    }
}

impl Phase for PhaseState<Finished> {
    const NAME: PhaseName = PhaseName::Finished;

    fn process(&mut self) -> Result<(), SimulationError> {
        info!(
            rounds_completed = self.shared.rounds_completed,
            best_score = ?self.shared.best_score,
            "simulation finished"
        );
        Ok(())
    }

    fn next(self) -> Transition {
        Transition::Complete(Ok(self.shared.report()))
    }
}
