use derive_more::Display;

use fedsim_core::{holdout::HoldoutSpec, pipeline::Pipeline, tensor::TensorDict};

use super::Failure;
use crate::{
    collaborator::Collaborator,
    settings::Weighting,
    state_machine::{SimulationError, StateMachine, StopHandle},
    storage::CheckpointStore,
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Init")]
    Init,
    #[display(fmt = "RoundInProgress")]
    RoundInProgress,
    #[display(fmt = "RoundComplete")]
    RoundComplete,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Finished")]
    Finished,
}

/// The result of stepping the state machine by one phase.
pub enum Transition {
    /// The simulation continues with the next phase.
    Next(StateMachine),
    /// The simulation ended, successfully or not.
    Complete(Result<crate::state_machine::SimulationReport, SimulationError>),
}

/// A trait that must be implemented by a state in order to move to a next
/// state.
pub trait Phase {
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    fn process(&mut self) -> Result<(), SimulationError>;

    /// Moves from this phase to the next phase.
    fn next(self) -> Transition;
}

/// The state shared by and accessible to all `PhaseState`s.
pub struct Shared {
    /// The current round, starting at one.
    pub(in crate::state_machine) round: u32,
    /// The number of rounds to run.
    pub(in crate::state_machine) limit: u32,
    /// Whether collaborator failures abort the round or only exclude the
    /// collaborator.
    pub(in crate::state_machine) fault_tolerant: bool,
    /// The contribution weighting scheme.
    pub(in crate::state_machine) weighting: Weighting,
    /// The plan's holdout specification.
    pub(in crate::state_machine) spec: HoldoutSpec,
    /// The plan's transformation pipeline for broadcast and contributions.
    pub(in crate::state_machine) pipeline: Pipeline,
    /// The simulated collaborators, in roster order.
    pub(in crate::state_machine) collaborators: Vec<Collaborator>,
    /// The checkpoint store.
    pub(in crate::state_machine) store: CheckpointStore,
    /// The current global shared weights.
    pub(in crate::state_machine) global: TensorDict,
    /// The best aggregated score seen so far.
    pub(in crate::state_machine) best_score: Option<f64>,
    /// The number of rounds completed so far.
    pub(in crate::state_machine) rounds_completed: u32,
    /// The cooperative stop signal.
    pub(in crate::state_machine) stop: StopHandle,
}

impl Shared {
    /// Checks whether the simulation should end after the current round.
    pub(in crate::state_machine) fn should_finish(&self) -> bool {
        self.round >= self.limit || self.stop.is_stopped()
    }

    pub(in crate::state_machine) fn report(&self) -> crate::state_machine::SimulationReport {
        crate::state_machine::SimulationReport {
            rounds_completed: self.rounds_completed,
            best_score: self.best_score,
        }
    }
}

/// The state corresponding to a phase of the simulation.
///
/// This contains the phase-dependent `private` state and the
/// phase-independent `shared` state which is shared across state
/// transitions.
pub struct PhaseState<S> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared simulation state.
    pub(in crate::state_machine) shared: Shared,
}

impl<S> PhaseState<S>
where
    Self: Phase,
{
    /// Runs the current phase to completion and transitions to the next
    /// phase, or to [`Failure`][super::Failure] if the phase tasks failed.
    pub fn run_phase(mut self) -> Transition {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase);
        let _enter = span.enter();

        info!("starting phase");
        if let Err(err) = self.process() {
            warn!("failed to perform the phase tasks");
            return Transition::Next(self.into_failure_state(err));
        }
        debug!("phase ran successfully");

        debug!("transitioning to the next phase");
        self.next()
    }

    fn into_failure_state(self, err: SimulationError) -> StateMachine {
        PhaseState::<Failure>::new(self.shared, err).into()
    }
}
