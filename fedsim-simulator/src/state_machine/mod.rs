//! The state machine that drives a simulation run.
//!
//! # Overview
//!
//! A run starts in the **Init** phase, which establishes the initial
//! global shared weights (from an existing `init` checkpoint, or from the
//! first collaborator) and writes the `init` checkpoint. It then
//! alternates between **RoundInProgress** (broadcast, parallel local
//! training, aggregation) and **RoundComplete** (install the aggregate,
//! update the `latest` and `best` checkpoints) until the round limit is
//! reached or a stop is requested, ending in **Finished**. Any phase error
//! moves the machine to **Failure**, which ends the run with the error.
//!
//! The machine is created through the [`SimulationInitializer`], which
//! also hands out a [`StopHandle`] for requesting a cooperative stop from
//! another thread.

pub mod phases;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derive_more::From;
use thiserror::Error;

use fedsim_core::{record::CodecError, tensor::TensorDict};

use self::phases::{
    Failure,
    Finished,
    Init,
    PhaseState,
    RoundComplete,
    RoundInProgress,
    Shared,
    Transition,
};
use crate::{
    aggregation::AggregationError,
    collaborator::Collaborator,
    model::{ModelError, ModelRegistry},
    roster::{DataConfig, Roster, RosterError},
    settings::Settings,
    storage::{CheckpointStore, StorageError},
};

/// An error that ends a simulation run.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid federation plan: {0}")]
    Plan(String),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("failed to construct the model of collaborator {id}: {cause:#}")]
    ModelInit { id: String, cause: ModelError },
    #[error("collaborator {id} failed in round {round}: {cause:#}")]
    Collaborator {
        id: String,
        round: u32,
        cause: ModelError,
    },
    #[error("weight record codec failed in round {round}")]
    Codec {
        round: u32,
        #[source]
        source: CodecError,
    },
    #[error("aggregation failed in round {round}")]
    Aggregation {
        round: u32,
        #[source]
        source: AggregationError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// The summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    /// The number of rounds that completed.
    pub rounds_completed: u32,
    /// The best aggregated validation score, if any round completed.
    pub best_score: Option<f64>,
}

/// A handle for requesting a cooperative stop of a running simulation.
///
/// The machine checks the handle at phase boundaries; the round in flight
/// still completes and is checkpointed.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests the simulation to stop after the current round.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Checks whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine {
    Init(PhaseState<Init>),
    RoundInProgress(PhaseState<RoundInProgress>),
    RoundComplete(PhaseState<RoundComplete>),
    Failure(PhaseState<Failure>),
    Finished(PhaseState<Finished>),
}

impl StateMachine {
    /// Moves the [`StateMachine`] to the next state and consumes the
    /// current one.
    pub fn next(self) -> Transition {
        match self {
            StateMachine::Init(state) => state.run_phase(),
            StateMachine::RoundInProgress(state) => state.run_phase(),
            StateMachine::RoundComplete(state) => state.run_phase(),
            StateMachine::Failure(state) => state.run_phase(),
            StateMachine::Finished(state) => state.run_phase(),
        }
    }

    /// Runs the state machine until the simulation ends.
    pub fn run(mut self) -> Result<SimulationReport, SimulationError> {
        loop {
            match self.next() {
                Transition::Next(next) => self = next,
                Transition::Complete(outcome) => return outcome,
            }
        }
    }
}

/// The state machine initializer that initializes a new state machine.
pub struct SimulationInitializer {
    settings: Settings,
    roster: Roster,
    data: DataConfig,
    registry: ModelRegistry,
}

impl SimulationInitializer {
    /// Creates a new [`SimulationInitializer`].
    pub fn new(
        settings: Settings,
        roster: Roster,
        data: DataConfig,
        registry: ModelRegistry,
    ) -> Self {
        Self {
            settings,
            roster,
            data,
            registry,
        }
    }

    /// Initializes a new [`StateMachine`] with the given plan.
    ///
    /// Builds one collaborator per roster entry and opens the checkpoint
    /// store; the machine itself has not run yet.
    pub fn init(self) -> Result<(StateMachine, StopHandle), SimulationError> {
        let spec = self
            .settings
            .holdout
            .to_spec()
            .map_err(|err| SimulationError::Plan(err.to_string()))?;
        let pipeline = self
            .settings
            .pipeline
            .to_pipeline()
            .map_err(|err| SimulationError::Plan(err.to_string()))?;
        self.data.check_roster(&self.roster)?;

        let mut collaborators = Vec::with_capacity(self.roster.len());
        for id in self.roster.ids() {
            let data = self
                .data
                .get(id)
                .ok_or(SimulationError::Internal("roster check let a gap through"))?;
            let model = self
                .registry
                .build(&self.settings.model.kind, data)
                .map_err(|cause| SimulationError::ModelInit {
                    id: id.clone(),
                    cause,
                })?;
            collaborators.push(Collaborator::new(id.clone(), model, &spec));
        }
        info!(
            collaborators = collaborators.len(),
            rounds = self.settings.round.limit,
            "simulation initialized"
        );

        let store = CheckpointStore::new(&self.settings.checkpoints.dir)?;
        let stop = StopHandle::default();
        let shared = Shared {
            round: 1,
            limit: self.settings.round.limit,
            fault_tolerant: self.settings.round.fault_tolerant,
            weighting: self.settings.aggregation.weighting,
            spec,
            pipeline,
            collaborators,
            store,
            global: TensorDict::new(),
            best_score: None,
            rounds_completed: 0,
            stop: stop.clone(),
        };
        Ok((StateMachine::from(PhaseState::<Init>::new(shared)), stop))
    }
}
