//! Operational concerns: logging setup and counters.

pub mod telemetry;

pub use telemetry::{init_tracing, CountersSnapshot, EngineCounters, LogHandle};
