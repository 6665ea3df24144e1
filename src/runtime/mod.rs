pub mod chain;
pub mod constraint;
pub mod context;
pub mod environment;
pub mod orchestrator;
pub mod status;
pub mod task;
