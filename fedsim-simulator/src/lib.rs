//! # fedsim-simulator
//!
//! A single-process federated-learning simulator. It hosts every
//! collaborator of a federation in one process, drives them through
//! synchronous training rounds, aggregates their shared weights and
//! checkpoints the global model, all according to a federation plan loaded
//! from a configuration file.
//!
//! The data layer (tensor dictionaries, holdout partitioning,
//! transformation pipelines, the weight record codec) lives in
//! `fedsim-core`; this crate adds models, orchestration, storage and the
//! `fedsim` command line on top.

#[macro_use]
extern crate tracing;

pub mod aggregation;
pub mod collaborator;
pub mod inference;
pub mod model;
pub mod roster;
pub mod settings;
pub mod state_machine;
pub mod storage;
