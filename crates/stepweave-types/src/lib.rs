//! Shared domain types for stepweave.
//!
//! Serializable workflow definitions, execution records, engine events and
//! engine configuration. No runtime or async dependencies -- only serde,
//! serde_json and chrono.

pub mod config;
pub mod event;
pub mod workflow;
