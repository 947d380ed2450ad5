//! # fedsim-core
//!
//! The data layer of the fedsim federation simulator: tensor dictionaries
//! exchanged between models and the federation layer, the holdout
//! partitioner that keeps private parameters local, the per-tensor
//! transformation pipeline, and the weight record codec that turns a
//! dictionary into a portable binary blob.
//!
//! This crate is deliberately free of I/O, configuration and orchestration
//! concerns; those live in `fedsim-simulator`.

pub mod holdout;
pub mod pipeline;
pub mod record;
pub mod tensor;
