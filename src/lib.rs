//! Chained background task orchestration.
//!
//! A [`Chain`](runtime::chain::Chain) is an ordered list of tasks where each
//! task's output feeds the next. The [`Orchestrator`](runtime::orchestrator::Orchestrator)
//! owns chains by name, gates tasks on environment constraints, and publishes
//! every transition on a status stream.

pub mod actions;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod error;
pub mod image;
pub mod runtime;
pub mod text;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, TaskExecutionError};
pub use runtime::orchestrator::Orchestrator;
