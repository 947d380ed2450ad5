use super::{Phase, PhaseName, PhaseState, Shared, Transition};
use crate::state_machine::SimulationError;

/// The terminal phase of a failed run.
pub struct Failure {
    error: SimulationError,
}

impl PhaseState<Failure> {
    /// Creates a new failure state.
    pub fn new(shared: Shared, error: SimulationError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}

impl Phase for PhaseState<Failure> {
    const NAME: PhaseName = PhaseName::Failure;

    fn process(&mut self) -> Result<(), SimulationError> {
        error!(
            round = self.shared.round,
            error = %self.private.error,
            "simulation failed"
        );
        Ok(())
    }

    fn next(self) -> Transition {
        Transition::Complete(Err(self.private.error))
    }
}
