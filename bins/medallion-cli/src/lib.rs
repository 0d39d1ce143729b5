//! Orchestration of a full bronze → silver run, shared by the `medallion`
//! binary and the end-to-end tests.

pub mod pipeline;

pub use pipeline::{run, RunSummary};
