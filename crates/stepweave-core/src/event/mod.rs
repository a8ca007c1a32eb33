//! Engine event distribution.
//!
//! Execution and node lifecycle transitions are published as `EngineEvent`s
//! on an `EventBus`; callers obtain receivers via `WorkflowEngine::subscribe`.

pub mod bus;

pub use bus::EventBus;
