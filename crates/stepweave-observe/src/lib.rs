//! Observability setup for stepweave.
//!
//! The engine only emits `tracing` spans and events; installing a subscriber
//! is left to the embedding application. This crate provides the standard
//! one: `EnvFilter`-driven structured logs, optionally JSON-formatted, and an
//! optional OpenTelemetry bridge.

pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
