//! The phases of the simulation state machine.

mod complete;
mod failure;
mod finished;
mod init;
mod phase;
mod round;

pub use self::{
    complete::RoundComplete,
    failure::Failure,
    finished::Finished,
    init::Init,
    phase::{Phase, PhaseName, PhaseState, Shared, Transition},
    round::RoundInProgress,
};
